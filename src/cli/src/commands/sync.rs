//! Reconcile a schema file into the database.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use restraint_core::sync::{NewLevelPolicy, ReconciliationReport, SyncCounts, SyncEngine};
use serde::Serialize;
use tabled::Tabled;

use crate::context::Context;
use crate::output::{self, OutputFormat};
use crate::schema::load_schema;

#[derive(Args)]
pub struct SyncArgs {
    /// Schema file (.toml, .json, .yaml); defaults to sync.schema_path
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Reset every owned grant to exactly its declared default access
    #[arg(long)]
    flush: bool,

    /// Apply default access for levels newly added to existing permissions
    #[arg(long)]
    apply_new_levels: bool,

    /// Only parse and validate the schema
    #[arg(long)]
    check: bool,
}

#[derive(Tabled, Serialize)]
struct CountRow {
    #[tabled(rename = "Entity")]
    entity: &'static str,
    #[tabled(rename = "Created")]
    created: usize,
    #[tabled(rename = "Updated")]
    updated: usize,
    #[tabled(rename = "Deleted")]
    deleted: usize,
    #[tabled(rename = "Unchanged")]
    unchanged: usize,
}

impl CountRow {
    fn new(entity: &'static str, counts: &SyncCounts) -> Self {
        Self {
            entity,
            created: counts.created,
            updated: counts.updated,
            deleted: counts.deleted,
            unchanged: counts.unchanged,
        }
    }
}

fn count_rows(report: &ReconciliationReport) -> Vec<CountRow> {
    vec![
        CountRow::new("perm sets", &report.perm_sets),
        CountRow::new("perms", &report.perms),
        CountRow::new("perm levels", &report.perm_levels),
    ]
}

pub async fn execute(args: SyncArgs, ctx: &Context, format: OutputFormat) -> Result<()> {
    let path = args
        .schema
        .or_else(|| ctx.settings.sync.schema_path.as_ref().map(PathBuf::from))
        .context("No schema file: pass --schema or set sync.schema_path")?;
    let schema = load_schema(&path)?;

    if args.check {
        output::print_success(&format!(
            "{} is valid: {} perm sets, {} perms",
            path.display(),
            schema.perm_sets.len(),
            schema.perms.len()
        ));
        return Ok(());
    }

    let mut options = ctx.settings.sync.options();
    options.flush_default_access |= args.flush;
    if args.apply_new_levels {
        options.new_levels = NewLevelPolicy::Apply;
    }

    let store = ctx.store().await?;
    let report = SyncEngine::new(store).reconcile_with(&schema, options).await?;

    match format {
        OutputFormat::Table => {
            output::print_list(&count_rows(&report), format)?;
            output::print_detail("New perms", &report.new_perms.iter().cloned().collect::<Vec<_>>().join(", "));
            output::print_detail("Grants created", &report.grants_created.to_string());
            output::print_detail("Levels linked", &report.levels_linked.to_string());
            if report.is_noop() {
                output::print_info("Already in sync");
            } else {
                output::print_success("Reconciliation committed");
            }
        }
        _ => output::print_item(&report, format)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_rows_follow_report() {
        let mut report = ReconciliationReport::default();
        report.perms.created = 3;
        report.perm_levels.deleted = 1;

        let rows = count_rows(&report);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].created, 3);
        assert_eq!(rows[2].deleted, 1);
    }
}
