//! Sync Engine: reconciles a [`DeclaredSchema`] into an [`AccessStore`].
//!
//! One reconciliation is one transaction. Phases run in dependency order:
//!
//! 1. private permission sets, keyed by name
//! 2. permissions, keyed by name
//! 3. permission levels, keyed by (permission, name)
//! 4. default access of every owned set
//!
//! Default access is additive. A grant that already existed is only touched
//! for permissions created in this pass, unless the caller flushes, in which
//! case every owned grant is reset to exactly its declared levels.

pub mod diff;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::db::{get_or_create_grant, AccessStore, AccessTransaction};
use crate::error::{RestraintError, Result};
use crate::rbac::declaration::{ConfigRegistry, DeclaredSchema};
use crate::rbac::models::{GrantHolder, GrantedLevel, Perm, PermLevel, PermSet, RecordId, Subject};
use crate::telemetry::metrics::{record_reconcile, ReconcileOutcome};

use self::diff::{diff, Diff};

// ═══════════════════════════════════════════════════════════════════════════════
// Options and Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether levels added to an existing permission unlock default access on
/// grants that already existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewLevelPolicy {
    /// Only newly created permissions are applied to existing grants.
    #[default]
    Ignore,
    /// Newly created levels of existing permissions are applied too.
    Apply,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Reset every owned grant to exactly its declared levels.
    #[serde(default)]
    pub flush_default_access: bool,
    #[serde(default)]
    pub new_levels: NewLevelPolicy,
}

impl ReconcileOptions {
    pub fn flush() -> Self {
        Self {
            flush_default_access: true,
            ..Self::default()
        }
    }
}

/// Row counts for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl SyncCounts {
    fn from_diff<K, D>(plan: &Diff<K, D>) -> Self {
        Self {
            created: plan.create.len(),
            updated: plan.update.len(),
            deleted: plan.delete.len(),
            unchanged: plan.unchanged.len(),
        }
    }

    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub perm_sets: SyncCounts,
    pub perms: SyncCounts,
    pub perm_levels: SyncCounts,
    /// Permissions created in this pass.
    pub new_perms: BTreeSet<String>,
    /// Levels created in this pass.
    pub new_levels: BTreeSet<GrantedLevel>,
    pub grants_created: usize,
    /// Level links added to set grants.
    pub levels_linked: usize,
    pub flushed: bool,
}

impl ReconciliationReport {
    /// Whether the store was left exactly as it was found.
    pub fn is_noop(&self) -> bool {
        !self.perm_sets.changed()
            && !self.perms.changed()
            && !self.perm_levels.changed()
            && self.grants_created == 0
            && self.levels_linked == 0
            && !self.flushed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies declared schemas to a store.
///
/// Concurrent reconciliations against one store must be serialized by the
/// caller.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn AccessStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, schema: &DeclaredSchema, flush_default_access: bool) -> Result<ReconciliationReport> {
        self.reconcile_with(
            schema,
            ReconcileOptions {
                flush_default_access,
                ..ReconcileOptions::default()
            },
        )
        .await
    }

    /// Reconcile the schema of the registered configuration.
    pub async fn reconcile_registered<S: Subject>(
        &self,
        registry: &ConfigRegistry<S>,
        options: ReconcileOptions,
    ) -> Result<ReconciliationReport> {
        let config = registry.get()?;
        self.reconcile_with(config.schema(), options).await
    }

    /// Run a reconciliation. Nothing persists unless every phase succeeds.
    #[instrument(skip_all, fields(flush = options.flush_default_access, new_levels = ?options.new_levels))]
    pub async fn reconcile_with(&self, schema: &DeclaredSchema, options: ReconcileOptions) -> Result<ReconciliationReport> {
        let started = Instant::now();

        if let Err(err) = schema.validate() {
            err.log();
            record_reconcile(ReconcileOutcome::RolledBack, started.elapsed().as_secs_f64());
            return Err(err);
        }

        let mut tx = self.store.begin().await?;
        let outcome = match apply(tx.as_mut(), schema, options).await {
            Ok(report) => tx.commit().await.map(|_| report),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed reconciliation also failed");
                }
                Err(err)
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(report) => {
                record_reconcile(ReconcileOutcome::Committed, elapsed);
                info!(
                    perm_sets = ?report.perm_sets,
                    perms = ?report.perms,
                    perm_levels = ?report.perm_levels,
                    grants_created = report.grants_created,
                    levels_linked = report.levels_linked,
                    elapsed_secs = elapsed,
                    "Reconciliation committed"
                );
                Ok(report)
            }
            Err(err) => {
                record_reconcile(ReconcileOutcome::RolledBack, elapsed);
                warn!(code = %err.code(), error = %err, "Reconciliation rolled back");
                Err(err)
            }
        }
    }
}

async fn apply(
    tx: &mut dyn AccessTransaction,
    schema: &DeclaredSchema,
    options: ReconcileOptions,
) -> Result<ReconciliationReport> {
    let mut report = ReconciliationReport {
        flushed: options.flush_default_access,
        ..ReconciliationReport::default()
    };

    let set_ids = sync_perm_sets(tx, schema, &mut report).await?;
    let perm_ids = sync_perms(tx, schema, &mut report).await?;
    let level_ids = sync_perm_levels(tx, schema, &perm_ids, &mut report).await?;
    sync_default_access(tx, schema, &set_ids, &level_ids, options, &mut report).await?;

    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Phases
// ═══════════════════════════════════════════════════════════════════════════════

async fn sync_perm_sets(
    tx: &mut dyn AccessTransaction,
    schema: &DeclaredSchema,
    report: &mut ReconciliationReport,
) -> Result<BTreeMap<String, RecordId>> {
    let existing = tx.perm_sets().await?.into_iter().filter(|s| s.is_private).collect();
    let desired = schema
        .perm_sets
        .iter()
        .map(|(name, decl)| {
            let row = PermSet {
                name: name.clone(),
                display_name: decl.display_name.clone(),
                is_private: true,
                is_locked: decl.locked,
                is_hidden: decl.hidden,
            };
            (name.clone(), row)
        })
        .collect();

    let plan = diff(existing, desired, |s: &PermSet| s.name.clone());
    report.perm_sets = SyncCounts::from_diff(&plan);

    let mut ids: BTreeMap<String, RecordId> = plan.unchanged.into_iter().collect();
    for (name, id) in plan.delete {
        debug!(perm_set = %name, "Deleting permission set");
        tx.delete_perm_set(id).await?;
    }
    for (name, id, row) in plan.update {
        tx.update_perm_set(id, &row).await?;
        ids.insert(name, id);
    }
    for (name, row) in plan.create {
        debug!(perm_set = %name, "Creating permission set");
        let record = tx.insert_perm_set(&row).await?;
        ids.insert(name, record.id);
    }

    Ok(ids)
}

async fn sync_perms(
    tx: &mut dyn AccessTransaction,
    schema: &DeclaredSchema,
    report: &mut ReconciliationReport,
) -> Result<BTreeMap<String, RecordId>> {
    let existing = tx.perms().await?;
    let desired = schema
        .perms
        .iter()
        .map(|(name, decl)| {
            let row = Perm {
                name: name.clone(),
                display_name: decl.display_name.clone(),
                is_locked: decl.locked,
                is_hidden: decl.hidden,
            };
            (name.clone(), row)
        })
        .collect();

    let plan = diff(existing, desired, |p: &Perm| p.name.clone());
    report.perms = SyncCounts::from_diff(&plan);

    let mut ids: BTreeMap<String, RecordId> = plan.unchanged.into_iter().collect();
    for (name, id) in plan.delete {
        debug!(perm = %name, "Deleting permission");
        tx.delete_perm(id).await?;
    }
    for (name, id, row) in plan.update {
        tx.update_perm(id, &row).await?;
        ids.insert(name, id);
    }
    for (name, row) in plan.create {
        debug!(perm = %name, "Creating permission");
        let record = tx.insert_perm(&row).await?;
        report.new_perms.insert(name.clone());
        ids.insert(name, record.id);
    }

    Ok(ids)
}

async fn sync_perm_levels(
    tx: &mut dyn AccessTransaction,
    schema: &DeclaredSchema,
    perm_ids: &BTreeMap<String, RecordId>,
    report: &mut ReconciliationReport,
) -> Result<BTreeMap<GrantedLevel, RecordId>> {
    let perm_names: BTreeMap<RecordId, &str> = perm_ids.iter().map(|(name, id)| (*id, name.as_str())).collect();

    let mut desired = BTreeMap::new();
    for (perm_name, decl) in &schema.perms {
        let perm_id = *perm_ids
            .get(perm_name)
            .ok_or_else(|| RestraintError::not_found("perm", perm_name))?;
        for (level_name, level) in decl.effective_levels().iter() {
            let row = PermLevel {
                perm_id,
                name: level_name.clone(),
                display_name: level.display_name.clone(),
            };
            desired.insert((perm_id, level_name.clone()), row);
        }
    }

    let existing = tx.perm_levels().await?;
    let plan = diff(existing, desired, |l: &PermLevel| (l.perm_id, l.name.clone()));
    report.perm_levels = SyncCounts::from_diff(&plan);

    let named = |perm_id: RecordId, level: String| -> Result<GrantedLevel> {
        let perm = perm_names
            .get(&perm_id)
            .ok_or_else(|| RestraintError::not_found("perm", perm_id.to_string()))?;
        Ok(GrantedLevel::new(*perm, level))
    };

    let mut ids = BTreeMap::new();
    for ((perm_id, level), id) in plan.unchanged {
        ids.insert(named(perm_id, level)?, id);
    }
    for ((perm_id, level), id) in plan.delete {
        debug!(perm_id, level = %level, "Deleting permission level");
        tx.delete_perm_level(id).await?;
    }
    for ((perm_id, level), id, row) in plan.update {
        tx.update_perm_level(id, &row).await?;
        ids.insert(named(perm_id, level)?, id);
    }
    for ((perm_id, level), row) in plan.create {
        let record = tx.insert_perm_level(&row).await?;
        let key = named(perm_id, level)?;
        debug!(perm = %key.perm, level = %key.level, "Creating permission level");
        report.new_levels.insert(key.clone());
        ids.insert(key, record.id);
    }

    Ok(ids)
}

async fn sync_default_access(
    tx: &mut dyn AccessTransaction,
    schema: &DeclaredSchema,
    set_ids: &BTreeMap<String, RecordId>,
    level_ids: &BTreeMap<GrantedLevel, RecordId>,
    options: ReconcileOptions,
    report: &mut ReconciliationReport,
) -> Result<()> {
    let no_access = BTreeMap::new();

    for (set_name, set_id) in set_ids {
        let (grant, created) = get_or_create_grant(tx, &GrantHolder::perm_set(*set_id)).await?;
        if created {
            report.grants_created += 1;
        }

        let mut pending = BTreeSet::new();
        for (perm_name, level_names) in schema.default_access.get(set_name).unwrap_or(&no_access) {
            if level_names.is_empty() {
                return Err(RestraintError::configuration_invalid(
                    "default_access",
                    format!("{}.{}", set_name, perm_name),
                    "declares no levels",
                ));
            }

            let unlocked = created || options.flush_default_access || report.new_perms.contains(perm_name);
            for level_name in level_names {
                let key = GrantedLevel::new(perm_name, level_name);
                let applies = unlocked
                    || (options.new_levels == NewLevelPolicy::Apply && report.new_levels.contains(&key));
                if !applies {
                    continue;
                }
                let id = level_ids.get(&key).ok_or_else(|| {
                    RestraintError::configuration_invalid(
                        "default_access",
                        format!("{}.{}.{}", set_name, perm_name, level_name),
                        "references an undeclared level",
                    )
                })?;
                pending.insert(*id);
            }
        }

        let linked = pending.difference(&grant.level_ids).count();
        if options.flush_default_access {
            tx.clear_grant_levels(grant.id).await?;
        }

        if !pending.is_empty() {
            let pending: Vec<RecordId> = pending.into_iter().collect();
            tx.add_grant_levels(grant.id, &pending).await?;
        }
        if linked > 0 {
            debug!(perm_set = %set_name, linked, "Applied default access");
        }
        report.levels_linked += linked;
    }

    Ok(())
}
