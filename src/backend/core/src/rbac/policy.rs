//! Permission resolution for one subject.
//!
//! A [`Restraint`] loads the subject's effective permission map once and
//! answers every later check and filter from memory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::declaration::{ConfigRegistry, LevelFilter, RestraintConfig};
use super::filter::{Candidate, FilterDecision};
use super::models::{EntityId, Subject};
use crate::db::AccessStore;
use crate::error::Result;
use crate::telemetry::metrics::{record_filter_decision, record_resolve};

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Map
// ═══════════════════════════════════════════════════════════════════════════════

/// Permission name -> level name -> filter.
pub struct PermissionMap<S: Subject> {
    perms: BTreeMap<String, BTreeMap<String, LevelFilter<S>>>,
}

impl<S: Subject> PermissionMap<S> {
    pub fn new() -> Self {
        Self { perms: BTreeMap::new() }
    }

    pub fn insert(&mut self, perm: impl Into<String>, level: impl Into<String>, filter: LevelFilter<S>) {
        self.perms.entry(perm.into()).or_default().insert(level.into(), filter);
    }

    /// Whether `perm` is held at any level.
    pub fn contains_perm(&self, perm: &str) -> bool {
        self.perms.get(perm).is_some_and(|levels| !levels.is_empty())
    }

    pub fn contains_level(&self, perm: &str, level: &str) -> bool {
        self.perms.get(perm).is_some_and(|levels| levels.contains_key(level))
    }

    pub fn levels(&self, perm: &str) -> Option<&BTreeMap<String, LevelFilter<S>>> {
        self.perms.get(perm)
    }

    /// Held level names per permission, without the filters.
    pub fn names(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.perms
            .iter()
            .map(|(perm, levels)| (perm.clone(), levels.keys().cloned().collect()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.perms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.perms.len()
    }
}

impl<S: Subject> Default for PermissionMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subject> Clone for PermissionMap<S> {
    fn clone(&self) -> Self {
        Self { perms: self.perms.clone() }
    }
}

impl<S: Subject> fmt::Debug for PermissionMap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.perms.iter()).finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Effective permissions of one subject.
///
/// ```rust,ignore
/// let restraint = Restraint::new(config, store, user);
/// if restraint.has_perm("can_edit", Some("all")).await? {
///     // ...
/// }
/// let visible = restraint.filter(account_ids, "can_view").await?;
/// ```
pub struct Restraint<S: Subject> {
    config: Arc<RestraintConfig<S>>,
    store: Arc<dyn AccessStore>,
    subject: S,
    perm_filter: Option<BTreeSet<String>>,
    perms: OnceCell<PermissionMap<S>>,
}

impl<S: Subject> Restraint<S> {
    pub fn new(config: Arc<RestraintConfig<S>>, store: Arc<dyn AccessStore>, subject: S) -> Self {
        Self {
            config,
            store,
            subject,
            perm_filter: None,
            perms: OnceCell::new(),
        }
    }

    /// Build against the process-wide registry.
    ///
    /// Fails with `ConfigurationMissing` if nothing was registered yet.
    pub fn from_registry(
        registry: &ConfigRegistry<S>,
        store: Arc<dyn AccessStore>,
        subject: S,
    ) -> Result<Self> {
        Ok(Self::new(registry.get()?, store, subject))
    }

    /// Only load these permissions.
    pub fn with_perm_filter<I, P>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.perm_filter = Some(perms.into_iter().map(Into::into).collect());
        self.perms = OnceCell::new();
        self
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    /// The permission map, loaded from the store on first use.
    pub async fn perms(&self) -> Result<&PermissionMap<S>> {
        self.perms.get_or_try_init(|| self.load()).await
    }

    #[instrument(skip(self), fields(subject = %self.subject.subject_key()))]
    async fn load(&self) -> Result<PermissionMap<S>> {
        let perm_sets = self.config.perm_sets_for(&self.subject);
        let granted = self
            .store
            .granted_levels(&perm_sets, &self.subject.subject_key(), self.perm_filter.as_ref())
            .await?;

        let mut map = PermissionMap::new();
        for level in granted {
            let filter = self.config.level_filter(&level.perm, &level.level);
            map.insert(level.perm, level.level, filter);
        }

        record_resolve();
        debug!(perm_sets = ?perm_sets, perms = map.len(), "Loaded permission map");
        Ok(map)
    }

    /// Run the checker chain for `perm`, optionally at one `level`.
    pub async fn has_perm(&self, perm: &str, level: Option<&str>) -> Result<bool> {
        let perms = self.perms().await?;
        Ok(self.config.checkers().check(&self.subject, perms, perm, level))
    }

    /// Decide what `perm` allows without touching any candidates.
    pub async fn decide(&self, perm: &str) -> Result<FilterDecision> {
        if !self.has_perm(perm, None).await? {
            return Ok(FilterDecision::Deny);
        }

        let perms = self.perms().await?;
        let Some(levels) = perms.levels(perm) else {
            // A custom checker allowed a permission with no loaded levels.
            return Ok(FilterDecision::AllowAll);
        };
        if levels.values().any(LevelFilter::is_unrestricted) {
            return Ok(FilterDecision::AllowAll);
        }

        let scoped = levels.values().filter_map(|filter| match filter {
            LevelFilter::Scoped(filter) => Some(filter.allowed_ids(&self.subject)),
            LevelFilter::Unrestricted => None,
        });
        let allowed: BTreeSet<EntityId> = try_join_all(scoped).await?.into_iter().flatten().collect();

        Ok(FilterDecision::AllowIds(allowed))
    }

    /// Keep the candidates `perm` allows.
    pub async fn filter<T: Candidate>(&self, candidates: Vec<T>, perm: &str) -> Result<Vec<T>> {
        let decision = self.decide(perm).await?;
        record_filter_decision(decision.label());
        Ok(decision.apply(candidates, None::<fn(&T) -> bool>))
    }

    /// Like [`Restraint::filter`], but `perm` only governs the candidates
    /// matching `restrict_to`; the rest pass through.
    pub async fn filter_restricted<T, R>(&self, candidates: Vec<T>, perm: &str, restrict_to: R) -> Result<Vec<T>>
    where
        T: Candidate,
        R: Fn(&T) -> bool,
    {
        let decision = self.decide(perm).await?;
        record_filter_decision(decision.label());
        Ok(decision.apply(candidates, Some(restrict_to)))
    }
}

impl<S: Subject + fmt::Debug> fmt::Debug for Restraint<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restraint")
            .field("subject", &self.subject)
            .field("perm_filter", &self.perm_filter)
            .field("loaded", &self.perms.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::BOOLEAN_LEVEL;

    type Key = crate::rbac::models::SubjectKey;

    #[test]
    fn test_permission_map_lookups() {
        let mut map: PermissionMap<Key> = PermissionMap::new();
        map.insert("can_edit", "own", LevelFilter::Unrestricted);
        map.insert("can_view", BOOLEAN_LEVEL, LevelFilter::Unrestricted);

        assert!(map.contains_perm("can_edit"));
        assert!(map.contains_level("can_edit", "own"));
        assert!(!map.contains_level("can_edit", "all"));
        assert!(map.contains_level("can_view", ""));
        assert!(!map.contains_perm("can_delete"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_permission_map_names() {
        let mut map: PermissionMap<Key> = PermissionMap::new();
        map.insert("can_edit", "own", LevelFilter::Unrestricted);
        map.insert("can_edit", "all", LevelFilter::Unrestricted);

        let names = map.names();
        let levels: Vec<&str> = names["can_edit"].iter().map(String::as_str).collect();
        assert_eq!(levels, vec!["all", "own"]);
    }
}
