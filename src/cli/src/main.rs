//! Restraint CLI - reconcile and administer permission graphs.
//!
//! Provides commands for migrations, schema sync, individual grants,
//! default access and inspection.

mod commands;
mod context;
mod output;
mod schema;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{access, migrate, show, sync};
use context::Context;
use output::OutputFormat;

/// Restraint - declarative permission sets and access grants
#[derive(Parser)]
#[command(
    name = "restraint",
    version = "0.1.0",
    about = "Restraint - declarative permission sets and access grants",
    long_about = "CLI tool for reconciling declared permission schemas into the database and managing live access grants.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Settings file (toml, json or yaml)
    #[arg(short, long, global = true, env = "RESTRAINT_CONFIG")]
    config: Option<String>,

    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Reconcile a declared schema into the database
    Sync(sync::SyncArgs),

    /// Grant a level to one subject
    Grant(access::SubjectArgs),

    /// Revoke a level from one subject
    Revoke(access::SubjectArgs),

    /// Replace a set's levels for one permission
    SetDefault(access::SetDefaultArgs),

    /// Seed a set's grant from another set
    CopyDefault(access::CopyDefaultArgs),

    /// Show permission sets, permissions and grants
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let ctx = match Context::load(cli.config.as_deref(), cli.database_url.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    };
    let format = cli.output;

    let result = match cli.command {
        Commands::Migrate => migrate::execute(&ctx).await,
        Commands::Sync(args) => sync::execute(args, &ctx, format).await,
        Commands::Grant(args) => access::grant(args, &ctx).await,
        Commands::Revoke(args) => access::revoke(args, &ctx).await,
        Commands::SetDefault(args) => access::set_default(args, &ctx).await,
        Commands::CopyDefault(args) => access::copy_default(args, &ctx).await,
        Commands::Show => show::execute(&ctx, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::try_parse_from([
            "restraint",
            "--output",
            "json",
            "sync",
            "--schema",
            "schema.toml",
            "--flush",
            "--apply-new-levels",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Sync(_)));
    }

    #[test]
    fn test_parse_grant_defaults_to_boolean_level() {
        let cli = Cli::try_parse_from(["restraint", "grant", "--subject-id", "7", "can_view"]).unwrap();
        assert!(matches!(cli.command, Commands::Grant(_)));
    }

    #[test]
    fn test_parse_set_default_without_levels() {
        let cli = Cli::try_parse_from(["restraint", "set-default", "users", "can_edit"]).unwrap();
        assert!(matches!(cli.command, Commands::SetDefault(_)));
    }
}
