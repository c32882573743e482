//! In-memory Access Store.
//!
//! Writers are serialized: a transaction holds the writer lock for its whole
//! lifetime and works on a private copy of the last committed state. Commit
//! swaps the copy in; drop discards it. Reads go straight to the committed
//! snapshot and never wait on a writer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{AccessStore, AccessTransaction};
use crate::error::{RestraintError, Result};
use crate::rbac::models::{
    AccessGrant, GrantHolder, GrantedLevel, Perm, PermLevel, PermSet, Record, RecordId, SubjectKey,
};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: RecordId,
    perm_sets: BTreeMap<RecordId, PermSet>,
    perms: BTreeMap<RecordId, Perm>,
    levels: BTreeMap<RecordId, PermLevel>,
    grants: BTreeMap<RecordId, AccessGrant>,
}

impl State {
    fn allocate(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn check_perm_set(&self, id: Option<RecordId>, perm_set: &PermSet) -> Result<()> {
        if self
            .perm_sets
            .iter()
            .any(|(other, s)| Some(*other) != id && s.name == perm_set.name)
        {
            return Err(RestraintError::conflict("perm_set", &perm_set.name));
        }
        Ok(())
    }

    fn check_perm(&self, id: Option<RecordId>, perm: &Perm) -> Result<()> {
        if self.perms.iter().any(|(other, p)| Some(*other) != id && p.name == perm.name) {
            return Err(RestraintError::conflict("perm", &perm.name));
        }
        Ok(())
    }

    fn check_level(&self, id: Option<RecordId>, level: &PermLevel) -> Result<()> {
        if !self.perms.contains_key(&level.perm_id) {
            return Err(RestraintError::not_found("perm", level.perm_id.to_string()));
        }
        if self
            .levels
            .iter()
            .any(|(other, l)| Some(*other) != id && l.perm_id == level.perm_id && l.name == level.name)
        {
            return Err(RestraintError::conflict(
                "perm_level",
                format!("{}.{}", level.perm_id, level.name),
            ));
        }
        Ok(())
    }

    fn grant_mut(&mut self, grant_id: RecordId) -> Result<&mut AccessGrant> {
        self.grants
            .get_mut(&grant_id)
            .ok_or_else(|| RestraintError::not_found("grant", grant_id.to_string()))
    }

    fn remove_level_links(&mut self, level_ids: &BTreeSet<RecordId>) {
        for grant in self.grants.values_mut() {
            grant.level_ids.retain(|id| !level_ids.contains(id));
        }
    }
}

/// Access Store held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccessStore {
    writer: Arc<Mutex<()>>,
    committed: Arc<RwLock<Arc<State>>>,
}

impl MemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot_state(&self) -> Arc<State> {
        self.committed.read().clone()
    }
}

#[async_trait]
impl AccessStore for MemoryAccessStore {
    async fn begin(&self) -> Result<Box<dyn AccessTransaction>> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let working = State::clone(&self.snapshot_state());
        Ok(Box::new(MemoryTransaction {
            _writer: writer,
            committed: Arc::clone(&self.committed),
            working,
        }))
    }

    async fn granted_levels(
        &self,
        perm_sets: &[String],
        subject: &SubjectKey,
        perms: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<GrantedLevel>> {
        let state = self.snapshot_state();

        let set_ids: BTreeSet<RecordId> = state
            .perm_sets
            .iter()
            .filter(|(_, s)| perm_sets.contains(&s.name))
            .map(|(id, _)| *id)
            .collect();

        let level_ids: BTreeSet<RecordId> = state
            .grants
            .values()
            .filter(|g| match &g.holder {
                GrantHolder::PermSet { perm_set_id } => set_ids.contains(perm_set_id),
                GrantHolder::Subject { subject: holder } => holder == subject,
            })
            .flat_map(|g| g.level_ids.iter().copied())
            .collect();

        Ok(level_ids
            .iter()
            .filter_map(|id| state.levels.get(id))
            .filter_map(|level| {
                let perm = state.perms.get(&level.perm_id)?;
                if perms.is_some_and(|filter| !filter.contains(&perm.name)) {
                    return None;
                }
                Some(GrantedLevel::new(&perm.name, &level.name))
            })
            .collect())
    }
}

struct MemoryTransaction {
    _writer: OwnedMutexGuard<()>,
    committed: Arc<RwLock<Arc<State>>>,
    working: State,
}

#[async_trait]
impl AccessTransaction for MemoryTransaction {
    async fn perm_sets(&mut self) -> Result<Vec<Record<PermSet>>> {
        Ok(self
            .working
            .perm_sets
            .iter()
            .map(|(id, s)| Record::new(*id, s.clone()))
            .collect())
    }

    async fn insert_perm_set(&mut self, perm_set: &PermSet) -> Result<Record<PermSet>> {
        self.working.check_perm_set(None, perm_set)?;
        let id = self.working.allocate();
        self.working.perm_sets.insert(id, perm_set.clone());
        Ok(Record::new(id, perm_set.clone()))
    }

    async fn update_perm_set(&mut self, id: RecordId, perm_set: &PermSet) -> Result<()> {
        self.working.check_perm_set(Some(id), perm_set)?;
        let row = self
            .working
            .perm_sets
            .get_mut(&id)
            .ok_or_else(|| RestraintError::not_found("perm_set", id.to_string()))?;
        *row = perm_set.clone();
        Ok(())
    }

    async fn delete_perm_set(&mut self, id: RecordId) -> Result<()> {
        if self.working.perm_sets.remove(&id).is_none() {
            return Err(RestraintError::not_found("perm_set", id.to_string()));
        }
        self.working
            .grants
            .retain(|_, g| g.holder != GrantHolder::perm_set(id));
        Ok(())
    }

    async fn perms(&mut self) -> Result<Vec<Record<Perm>>> {
        Ok(self
            .working
            .perms
            .iter()
            .map(|(id, p)| Record::new(*id, p.clone()))
            .collect())
    }

    async fn insert_perm(&mut self, perm: &Perm) -> Result<Record<Perm>> {
        self.working.check_perm(None, perm)?;
        let id = self.working.allocate();
        self.working.perms.insert(id, perm.clone());
        Ok(Record::new(id, perm.clone()))
    }

    async fn update_perm(&mut self, id: RecordId, perm: &Perm) -> Result<()> {
        self.working.check_perm(Some(id), perm)?;
        let row = self
            .working
            .perms
            .get_mut(&id)
            .ok_or_else(|| RestraintError::not_found("perm", id.to_string()))?;
        *row = perm.clone();
        Ok(())
    }

    async fn delete_perm(&mut self, id: RecordId) -> Result<()> {
        if self.working.perms.remove(&id).is_none() {
            return Err(RestraintError::not_found("perm", id.to_string()));
        }
        let orphaned: BTreeSet<RecordId> = self
            .working
            .levels
            .iter()
            .filter(|(_, l)| l.perm_id == id)
            .map(|(level_id, _)| *level_id)
            .collect();
        self.working.levels.retain(|level_id, _| !orphaned.contains(level_id));
        self.working.remove_level_links(&orphaned);
        Ok(())
    }

    async fn perm_levels(&mut self) -> Result<Vec<Record<PermLevel>>> {
        Ok(self
            .working
            .levels
            .iter()
            .map(|(id, l)| Record::new(*id, l.clone()))
            .collect())
    }

    async fn insert_perm_level(&mut self, level: &PermLevel) -> Result<Record<PermLevel>> {
        self.working.check_level(None, level)?;
        let id = self.working.allocate();
        self.working.levels.insert(id, level.clone());
        Ok(Record::new(id, level.clone()))
    }

    async fn update_perm_level(&mut self, id: RecordId, level: &PermLevel) -> Result<()> {
        self.working.check_level(Some(id), level)?;
        let row = self
            .working
            .levels
            .get_mut(&id)
            .ok_or_else(|| RestraintError::not_found("perm_level", id.to_string()))?;
        *row = level.clone();
        Ok(())
    }

    async fn delete_perm_level(&mut self, id: RecordId) -> Result<()> {
        if self.working.levels.remove(&id).is_none() {
            return Err(RestraintError::not_found("perm_level", id.to_string()));
        }
        self.working.remove_level_links(&BTreeSet::from([id]));
        Ok(())
    }

    async fn grant(&mut self, holder: &GrantHolder) -> Result<Option<Record<AccessGrant>>> {
        Ok(self
            .working
            .grants
            .iter()
            .find(|(_, g)| &g.holder == holder)
            .map(|(id, g)| Record::new(*id, g.clone())))
    }

    async fn create_grant(&mut self, holder: &GrantHolder) -> Result<Record<AccessGrant>> {
        if let GrantHolder::PermSet { perm_set_id } = holder {
            if !self.working.perm_sets.contains_key(perm_set_id) {
                return Err(RestraintError::not_found("perm_set", perm_set_id.to_string()));
            }
        }
        if self.working.grants.values().any(|g| &g.holder == holder) {
            return Err(RestraintError::conflict("grant", format!("{:?}", holder)));
        }
        let id = self.working.allocate();
        let grant = AccessGrant::empty(holder.clone());
        self.working.grants.insert(id, grant.clone());
        Ok(Record::new(id, grant))
    }

    async fn grants(&mut self) -> Result<Vec<Record<AccessGrant>>> {
        Ok(self
            .working
            .grants
            .iter()
            .map(|(id, g)| Record::new(*id, g.clone()))
            .collect())
    }

    async fn add_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()> {
        if let Some(missing) = level_ids.iter().find(|id| !self.working.levels.contains_key(id)) {
            return Err(RestraintError::not_found("perm_level", missing.to_string()));
        }
        self.working.grant_mut(grant_id)?.level_ids.extend(level_ids.iter().copied());
        Ok(())
    }

    async fn remove_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()> {
        self.working
            .grant_mut(grant_id)?
            .level_ids
            .retain(|id| !level_ids.contains(id));
        Ok(())
    }

    async fn clear_grant_levels(&mut self, grant_id: RecordId) -> Result<()> {
        self.working.grant_mut(grant_id)?.level_ids.clear();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { _writer, committed, working } = *self;
        *committed.write() = Arc::new(working);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_or_create_grant;
    use crate::error::ErrorCode;

    fn perm_set(name: &str) -> PermSet {
        PermSet {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            is_private: true,
            is_locked: false,
            is_hidden: false,
        }
    }

    fn perm(name: &str) -> Perm {
        Perm {
            name: name.to_string(),
            display_name: name.to_string(),
            is_locked: false,
            is_hidden: false,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryAccessStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_perm_set(&perm_set("staff")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.perm_sets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let store = MemoryAccessStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_perm_set(&perm_set("staff")).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.perm_sets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = MemoryAccessStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_perm(&perm("can_edit")).await.unwrap();
        let err = tx.insert_perm(&perm("can_edit")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageConflict);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_perm_cascades_to_levels_and_links() {
        let store = MemoryAccessStore::new();
        let mut tx = store.begin().await.unwrap();
        let set = tx.insert_perm_set(&perm_set("staff")).await.unwrap();
        let edit = tx.insert_perm(&perm("can_edit")).await.unwrap();
        let level = tx
            .insert_perm_level(&PermLevel {
                perm_id: edit.id,
                name: "all".to_string(),
                display_name: "All".to_string(),
            })
            .await
            .unwrap();
        let (grant, created) = get_or_create_grant(tx.as_mut(), &GrantHolder::perm_set(set.id))
            .await
            .unwrap();
        assert!(created);
        tx.add_grant_levels(grant.id, &[level.id]).await.unwrap();

        tx.delete_perm(edit.id).await.unwrap();

        assert!(tx.perm_levels().await.unwrap().is_empty());
        let grant = tx.grant(&GrantHolder::perm_set(set.id)).await.unwrap().unwrap();
        assert!(grant.level_ids.is_empty());
    }

    #[tokio::test]
    async fn test_granted_levels_unions_sets_and_subject() {
        let store = MemoryAccessStore::new();
        let alice = SubjectKey::new("user", 7);
        let mut tx = store.begin().await.unwrap();
        let staff = tx.insert_perm_set(&perm_set("staff")).await.unwrap();
        let edit = tx.insert_perm(&perm("can_edit")).await.unwrap();
        let view = tx.insert_perm(&perm("can_view")).await.unwrap();
        let own = tx
            .insert_perm_level(&PermLevel { perm_id: edit.id, name: "own".into(), display_name: "Own".into() })
            .await
            .unwrap();
        let boolean = tx
            .insert_perm_level(&PermLevel { perm_id: view.id, name: "".into(), display_name: "".into() })
            .await
            .unwrap();
        let set_grant = tx.create_grant(&GrantHolder::perm_set(staff.id)).await.unwrap();
        tx.add_grant_levels(set_grant.id, &[own.id]).await.unwrap();
        let subject_grant = tx.create_grant(&GrantHolder::subject(alice.clone())).await.unwrap();
        tx.add_grant_levels(subject_grant.id, &[boolean.id]).await.unwrap();
        tx.commit().await.unwrap();

        let levels = store
            .granted_levels(&["staff".to_string()], &alice, None)
            .await
            .unwrap();
        assert_eq!(levels.len(), 2);

        let filter = BTreeSet::from(["can_view".to_string()]);
        let levels = store
            .granted_levels(&["staff".to_string()], &alice, Some(&filter))
            .await
            .unwrap();
        assert_eq!(levels.into_iter().collect::<Vec<_>>(), vec![GrantedLevel::new("can_view", "")]);

        let levels = store
            .granted_levels(&[], &SubjectKey::new("user", 8), None)
            .await
            .unwrap();
        assert!(levels.is_empty());
    }

    #[tokio::test]
    async fn test_granted_levels_reads_committed_state_while_writer_open() {
        let store = MemoryAccessStore::new();
        let alice = SubjectKey::new("user", 1);
        let mut tx = store.begin().await.unwrap();
        let users = tx.insert_perm_set(&perm_set("users")).await.unwrap();
        let edit = tx.insert_perm(&perm("can_edit")).await.unwrap();
        let all = tx
            .insert_perm_level(&PermLevel { perm_id: edit.id, name: "all".into(), display_name: "All".into() })
            .await
            .unwrap();
        let grant = tx.create_grant(&GrantHolder::perm_set(users.id)).await.unwrap();
        tx.add_grant_levels(grant.id, &[all.id]).await.unwrap();
        tx.commit().await.unwrap();

        let mut open = store.begin().await.unwrap();
        open.clear_grant_levels(grant.id).await.unwrap();

        let levels = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            store.granted_levels(&["users".to_string()], &alice, None),
        )
        .await
        .expect("granted_levels waited on an open transaction")
        .unwrap();
        assert_eq!(levels.into_iter().collect::<Vec<_>>(), vec![GrantedLevel::new("can_edit", "all")]);

        open.commit().await.unwrap();
        let levels = store
            .granted_levels(&["users".to_string()], &alice, None)
            .await
            .unwrap();
        assert!(levels.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reads_do_not_serialize() {
        let store = MemoryAccessStore::new();
        let alice = SubjectKey::new("user", 1);
        let _open = store.begin().await.unwrap();

        let reads = (0..8).map(|_| store.granted_levels(&[], &alice, None));
        let results = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            futures::future::try_join_all(reads),
        )
        .await
        .expect("reads blocked")
        .unwrap();
        assert!(results.iter().all(|levels| levels.is_empty()));
    }
}
