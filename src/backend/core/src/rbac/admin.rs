//! Operator-facing changes to live access grants.
//!
//! Each operation runs in its own transaction. Names that do not resolve to
//! a row fail with `NotFound`.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use super::models::{AccessGraph, GrantHolder, Record, RecordId, SubjectKey};
use crate::db::{finish, get_or_create_grant, AccessStore, AccessTransaction};
use crate::error::{RestraintError, Result};

/// Administrative operations over an [`AccessStore`].
#[derive(Clone)]
pub struct AccessAdmin {
    store: Arc<dyn AccessStore>,
}

impl AccessAdmin {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    /// Make `levels` the only levels of `perm` held by the set's grant.
    ///
    /// Levels of other permissions are left alone. An empty `levels`
    /// removes the permission from the set.
    pub async fn set_default_access(&self, set: &str, perm: &str, levels: &[&str]) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = set_default(tx.as_mut(), set, perm, levels).await;
        finish(tx, result).await?;
        info!(perm_set = set, perm, levels = ?levels, "Set default access");
        Ok(())
    }

    /// Give one subject a level directly. Granting a held level is a no-op.
    pub async fn grant_individual_access(&self, subject: &SubjectKey, perm: &str, level: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = grant_individual(tx.as_mut(), subject, perm, level).await;
        finish(tx, result).await?;
        info!(subject = %subject, perm, level, "Granted individual access");
        Ok(())
    }

    /// Take a directly granted level away from one subject.
    ///
    /// Set-derived access is not affected.
    pub async fn revoke_individual_access(&self, subject: &SubjectKey, perm: &str, level: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = revoke_individual(tx.as_mut(), subject, perm, level).await;
        finish(tx, result).await?;
        info!(subject = %subject, perm, level, "Revoked individual access");
        Ok(())
    }

    /// Seed `to`'s grant with the levels `from` holds.
    ///
    /// Returns `false` without changing anything when `to` already had a grant.
    pub async fn copy_default_access(&self, from: &str, to: &str) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let result = copy_default(tx.as_mut(), from, to).await;
        let copied = finish(tx, result).await?;
        info!(from, to, copied, "Copied default access");
        Ok(copied)
    }

    pub async fn snapshot(&self) -> Result<AccessGraph> {
        self.store.snapshot().await
    }
}

async fn perm_set_id(tx: &mut dyn AccessTransaction, name: &str) -> Result<RecordId> {
    tx.perm_sets()
        .await?
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| s.id)
        .ok_or_else(|| RestraintError::not_found("perm_set", name))
}

async fn perm_id(tx: &mut dyn AccessTransaction, name: &str) -> Result<RecordId> {
    tx.perms()
        .await?
        .into_iter()
        .find(|p| p.name == name)
        .map(|p| p.id)
        .ok_or_else(|| RestraintError::not_found("perm", name))
}

/// Ids of every level of `perm`.
async fn perm_level_ids(tx: &mut dyn AccessTransaction, perm: &str) -> Result<Vec<Record<String>>> {
    let perm_id = perm_id(tx, perm).await?;
    Ok(tx
        .perm_levels()
        .await?
        .into_iter()
        .filter(|l| l.perm_id == perm_id)
        .map(|l| Record::new(l.id, l.data.name))
        .collect())
}

async fn level_id(tx: &mut dyn AccessTransaction, perm: &str, level: &str) -> Result<RecordId> {
    perm_level_ids(tx, perm)
        .await?
        .into_iter()
        .find(|l| l.data == level)
        .map(|l| l.id)
        .ok_or_else(|| RestraintError::not_found("perm_level", format!("{}.{}", perm, level)))
}

async fn set_default(tx: &mut dyn AccessTransaction, set: &str, perm: &str, levels: &[&str]) -> Result<()> {
    let set_id = perm_set_id(tx, set).await?;
    let perm_levels = perm_level_ids(tx, perm).await?;

    let mut wanted = Vec::with_capacity(levels.len());
    for level in levels {
        let id = perm_levels
            .iter()
            .find(|l| l.data == *level)
            .map(|l| l.id)
            .ok_or_else(|| RestraintError::not_found("perm_level", format!("{}.{}", perm, level)))?;
        wanted.push(id);
    }

    let (grant, _) = get_or_create_grant(tx, &GrantHolder::perm_set(set_id)).await?;
    let stale: Vec<RecordId> = perm_levels.iter().map(|l| l.id).collect();
    tx.remove_grant_levels(grant.id, &stale).await?;
    tx.add_grant_levels(grant.id, &wanted).await
}

async fn grant_individual(tx: &mut dyn AccessTransaction, subject: &SubjectKey, perm: &str, level: &str) -> Result<()> {
    let level_id = level_id(tx, perm, level).await?;
    let (grant, _) = get_or_create_grant(tx, &GrantHolder::subject(subject.clone())).await?;
    tx.add_grant_levels(grant.id, &[level_id]).await
}

async fn revoke_individual(tx: &mut dyn AccessTransaction, subject: &SubjectKey, perm: &str, level: &str) -> Result<()> {
    let grant = tx
        .grant(&GrantHolder::subject(subject.clone()))
        .await?
        .ok_or_else(|| RestraintError::not_found("grant", subject.to_string()))?;
    let level_id = level_id(tx, perm, level).await?;
    tx.remove_grant_levels(grant.id, &[level_id]).await
}

async fn copy_default(tx: &mut dyn AccessTransaction, from: &str, to: &str) -> Result<bool> {
    let from_id = perm_set_id(tx, from).await?;
    let to_id = perm_set_id(tx, to).await?;

    let (target, created) = get_or_create_grant(tx, &GrantHolder::perm_set(to_id)).await?;
    if !created {
        return Ok(false);
    }

    let levels: BTreeSet<RecordId> = tx
        .grant(&GrantHolder::perm_set(from_id))
        .await?
        .map(|g| g.data.level_ids)
        .unwrap_or_default();
    let levels: Vec<RecordId> = levels.into_iter().collect();
    tx.add_grant_levels(target.id, &levels).await?;

    Ok(true)
}
