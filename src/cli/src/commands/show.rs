//! Display the persisted authorization graph.

use anyhow::Result;
use restraint_core::db::AccessStore;
use restraint_core::rbac::{AccessGraph, GrantSummary, PermSummary};
use serde::Serialize;
use tabled::Tabled;

use crate::context::Context;
use crate::output::{self, level_label, OutputFormat};

#[derive(Tabled, Serialize)]
struct PermSetRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Display Name")]
    display_name: String,
    #[tabled(rename = "Owned")]
    owned: bool,
    #[tabled(rename = "Locked")]
    locked: bool,
    #[tabled(rename = "Hidden")]
    hidden: bool,
}

#[derive(Tabled, Serialize)]
struct PermRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Display Name")]
    display_name: String,
    #[tabled(rename = "Levels")]
    levels: String,
}

impl From<&PermSummary> for PermRow {
    fn from(perm: &PermSummary) -> Self {
        Self {
            name: perm.name.clone(),
            display_name: perm.display_name.clone(),
            levels: perm.levels.iter().map(|l| level_label(l)).collect::<Vec<_>>().join(", "),
        }
    }
}

#[derive(Tabled, Serialize)]
struct GrantRow {
    #[tabled(rename = "Holder")]
    holder: String,
    #[tabled(rename = "Access")]
    access: String,
}

impl From<&GrantSummary> for GrantRow {
    fn from(grant: &GrantSummary) -> Self {
        Self {
            holder: grant.holder.to_string(),
            access: grant
                .levels
                .iter()
                .map(|l| format!("{}:{}", l.perm, level_label(&l.level)))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn perm_set_rows(graph: &AccessGraph) -> Vec<PermSetRow> {
    graph
        .perm_sets
        .iter()
        .map(|s| PermSetRow {
            name: s.name.clone(),
            display_name: s.display_name.clone(),
            owned: s.is_private,
            locked: s.is_locked,
            hidden: s.is_hidden,
        })
        .collect()
}

pub async fn execute(ctx: &Context, format: OutputFormat) -> Result<()> {
    let store = ctx.store().await?;
    let graph = store.snapshot().await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Permission Sets");
            output::print_list(&perm_set_rows(&graph), format)?;
            output::print_header("Permissions");
            let perms: Vec<PermRow> = graph.perms.iter().map(PermRow::from).collect();
            output::print_list(&perms, format)?;
            output::print_header("Grants");
            let grants: Vec<GrantRow> = graph.grants.iter().map(GrantRow::from).collect();
            output::print_list(&grants, format)?;
        }
        _ => output::print_item(&graph, format)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use restraint_core::rbac::{GrantedLevel, HolderName};

    #[test]
    fn test_grant_row_labels_boolean_levels() {
        let grant = GrantSummary {
            holder: HolderName::PermSet { name: "users".to_string() },
            levels: [GrantedLevel::new("can_edit", "own"), GrantedLevel::new("can_view", "")]
                .into_iter()
                .collect(),
        };

        let row = GrantRow::from(&grant);
        assert_eq!(row.holder, "set:users");
        assert_eq!(row.access, "can_edit:own, can_view:(boolean)");
    }
}
