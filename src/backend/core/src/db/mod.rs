//! Access Store: persistence for perm sets, perms, levels and grants.
//!
//! Two backends implement [`AccessStore`]:
//! - [`MemoryAccessStore`] for tests and embedding
//! - [`PgAccessStore`] for PostgreSQL via sqlx

pub mod memory;
pub mod postgres;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::rbac::models::{
    AccessGraph, AccessGrant, GrantHolder, GrantSummary, GrantedLevel, HolderName, Perm, PermLevel,
    PermSet, PermSummary, Record, RecordId, SubjectKey,
};

pub use memory::MemoryAccessStore;
pub use postgres::PgAccessStore;

/// A transactional backend for the authorization graph.
#[async_trait]
pub trait AccessStore: Send + Sync {
    /// Start a transaction. Writes become visible only on commit.
    async fn begin(&self) -> Result<Box<dyn AccessTransaction>>;

    /// Levels granted to any of `perm_sets` or individually to `subject`,
    /// limited to `perms` when given.
    async fn granted_levels(
        &self,
        perm_sets: &[String],
        subject: &SubjectKey,
        perms: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<GrantedLevel>>;

    /// Read the whole graph by name.
    async fn snapshot(&self) -> Result<AccessGraph> {
        let mut tx = self.begin().await?;
        let graph = read_graph(tx.as_mut()).await;
        tx.rollback().await?;
        graph
    }
}

/// One unit of work against an [`AccessStore`].
///
/// Deletes cascade: a perm set takes its grant, a perm takes its levels,
/// a level takes its grant links. Dropping without commit discards writes.
#[async_trait]
pub trait AccessTransaction: Send {
    async fn perm_sets(&mut self) -> Result<Vec<Record<PermSet>>>;
    async fn insert_perm_set(&mut self, perm_set: &PermSet) -> Result<Record<PermSet>>;
    async fn update_perm_set(&mut self, id: RecordId, perm_set: &PermSet) -> Result<()>;
    async fn delete_perm_set(&mut self, id: RecordId) -> Result<()>;

    async fn perms(&mut self) -> Result<Vec<Record<Perm>>>;
    async fn insert_perm(&mut self, perm: &Perm) -> Result<Record<Perm>>;
    async fn update_perm(&mut self, id: RecordId, perm: &Perm) -> Result<()>;
    async fn delete_perm(&mut self, id: RecordId) -> Result<()>;

    async fn perm_levels(&mut self) -> Result<Vec<Record<PermLevel>>>;
    async fn insert_perm_level(&mut self, level: &PermLevel) -> Result<Record<PermLevel>>;
    async fn update_perm_level(&mut self, id: RecordId, level: &PermLevel) -> Result<()>;
    async fn delete_perm_level(&mut self, id: RecordId) -> Result<()>;

    async fn grant(&mut self, holder: &GrantHolder) -> Result<Option<Record<AccessGrant>>>;
    async fn create_grant(&mut self, holder: &GrantHolder) -> Result<Record<AccessGrant>>;
    async fn grants(&mut self) -> Result<Vec<Record<AccessGrant>>>;
    async fn add_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()>;
    async fn remove_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()>;
    async fn clear_grant_levels(&mut self, grant_id: RecordId) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Fetch the grant for `holder`, creating an empty one if absent.
///
/// The flag is `true` when the grant was created by this call.
pub async fn get_or_create_grant(
    tx: &mut dyn AccessTransaction,
    holder: &GrantHolder,
) -> Result<(Record<AccessGrant>, bool)> {
    match tx.grant(holder).await? {
        Some(grant) => Ok((grant, false)),
        None => Ok((tx.create_grant(holder).await?, true)),
    }
}

/// Build an [`AccessGraph`] from inside a transaction.
pub async fn read_graph(tx: &mut dyn AccessTransaction) -> Result<AccessGraph> {
    let perm_sets = tx.perm_sets().await?;
    let perms = tx.perms().await?;
    let levels = tx.perm_levels().await?;
    let grants = tx.grants().await?;

    let perm_names: BTreeMap<RecordId, &str> = perms.iter().map(|p| (p.id, p.name.as_str())).collect();
    let set_names: BTreeMap<RecordId, &str> = perm_sets.iter().map(|s| (s.id, s.name.as_str())).collect();
    let level_names: BTreeMap<RecordId, GrantedLevel> = levels
        .iter()
        .filter_map(|l| perm_names.get(&l.perm_id).map(|perm| (l.id, GrantedLevel::new(*perm, &l.name))))
        .collect();

    let mut perm_summaries: Vec<PermSummary> = perms
        .iter()
        .map(|p| PermSummary {
            name: p.name.clone(),
            display_name: p.display_name.clone(),
            is_locked: p.is_locked,
            is_hidden: p.is_hidden,
            levels: levels.iter().filter(|l| l.perm_id == p.id).map(|l| l.name.clone()).collect(),
        })
        .collect();
    perm_summaries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut grant_summaries: Vec<GrantSummary> = grants
        .iter()
        .filter_map(|g| {
            let holder = match &g.holder {
                GrantHolder::PermSet { perm_set_id } => HolderName::PermSet {
                    name: set_names.get(perm_set_id)?.to_string(),
                },
                GrantHolder::Subject { subject } => HolderName::Subject { subject: subject.clone() },
            };
            let levels = g.level_ids.iter().filter_map(|id| level_names.get(id).cloned()).collect();
            Some(GrantSummary { holder, levels })
        })
        .collect();
    grant_summaries.sort_by(|a, b| a.holder.cmp(&b.holder));

    let mut perm_sets: Vec<PermSet> = perm_sets.into_iter().map(|s| s.data).collect();
    perm_sets.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(AccessGraph {
        perm_sets,
        perms: perm_summaries,
        grants: grant_summaries,
        captured_at: Utc::now(),
    })
}

/// Commit on success, roll back on failure, and hand back `result`.
pub async fn finish<T>(tx: Box<dyn AccessTransaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
