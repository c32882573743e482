//! Administrative grant changes.

use anyhow::Result;
use clap::Args;
use restraint_core::rbac::{AccessAdmin, SubjectKey};

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct SubjectArgs {
    /// Subject type, e.g. "user"
    #[arg(long, default_value = "user")]
    subject_type: String,

    /// Subject id
    #[arg(long)]
    subject_id: i64,

    /// Permission name
    perm: String,

    /// Level name; omit for a boolean permission
    #[arg(default_value = "")]
    level: String,
}

impl SubjectArgs {
    fn subject(&self) -> SubjectKey {
        SubjectKey::new(&self.subject_type, self.subject_id)
    }
}

#[derive(Args)]
pub struct SetDefaultArgs {
    /// Permission set name
    set: String,

    /// Permission name
    perm: String,

    /// Levels the set should hold; none removes the permission
    levels: Vec<String>,
}

#[derive(Args)]
pub struct CopyDefaultArgs {
    /// Source permission set
    from: String,

    /// Target permission set
    to: String,
}

async fn admin(ctx: &Context) -> Result<AccessAdmin> {
    Ok(AccessAdmin::new(ctx.store().await?))
}

pub async fn grant(args: SubjectArgs, ctx: &Context) -> Result<()> {
    let subject = args.subject();
    admin(ctx)
        .await?
        .grant_individual_access(&subject, &args.perm, &args.level)
        .await?;
    output::print_success(&format!(
        "Granted {}:{} to {}",
        args.perm,
        output::level_label(&args.level),
        subject
    ));
    Ok(())
}

pub async fn revoke(args: SubjectArgs, ctx: &Context) -> Result<()> {
    let subject = args.subject();
    admin(ctx)
        .await?
        .revoke_individual_access(&subject, &args.perm, &args.level)
        .await?;
    output::print_success(&format!(
        "Revoked {}:{} from {}",
        args.perm,
        output::level_label(&args.level),
        subject
    ));
    Ok(())
}

pub async fn set_default(args: SetDefaultArgs, ctx: &Context) -> Result<()> {
    let levels: Vec<&str> = args.levels.iter().map(String::as_str).collect();
    admin(ctx)
        .await?
        .set_default_access(&args.set, &args.perm, &levels)
        .await?;
    output::print_success(&format!("Set default access of {} for {}", args.set, args.perm));
    Ok(())
}

pub async fn copy_default(args: CopyDefaultArgs, ctx: &Context) -> Result<()> {
    let copied = admin(ctx).await?.copy_default_access(&args.from, &args.to).await?;
    if copied {
        output::print_success(&format!("Copied default access from {} to {}", args.from, args.to));
    } else {
        output::print_info(&format!("{} already has a grant; nothing copied", args.to));
    }
    Ok(())
}
