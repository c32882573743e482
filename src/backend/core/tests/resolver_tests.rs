//! Integration tests for resolution, checking and result filtering.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use restraint_core::db::{AccessStore, AccessTransaction, MemoryAccessStore};
use restraint_core::error::{ErrorCode, RestraintError, Result};
use restraint_core::rbac::{
    AccessAdmin, ConfigRegistry, DeclaredSchema, EntityId, FnChecker, GrantedLevel, LevelFilter, PermDecl,
    PermSetDecl, PermissionMap, Record, Restraint, RestraintConfig, Subject, SubjectKey,
};
use restraint_core::sync::SyncEngine;

// ═══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct User {
    id: i64,
    roles: Vec<&'static str>,
    superuser: bool,
}

impl User {
    fn new(id: i64, roles: &[&'static str]) -> Self {
        Self {
            id,
            roles: roles.to_vec(),
            superuser: false,
        }
    }
}

impl Subject for User {
    fn subject_key(&self) -> SubjectKey {
        SubjectKey::new("user", self.id)
    }
}

fn schema() -> DeclaredSchema {
    DeclaredSchema::new()
        .with_perm_set("admins", PermSetDecl::new("Admins"))
        .with_perm_set("users", PermSetDecl::new("Users"))
        .with_perm_set("leads", PermSetDecl::new("Team Leads"))
        .with_perm(
            "can_edit",
            PermDecl::new("Can Edit")
                .with_level("all", "All")
                .with_level("own", "Own")
                .with_level("team", "Team"),
        )
        .with_perm("can_view", PermDecl::new("Can View"))
        .with_perm("can_delete", PermDecl::new("Can Delete"))
        .with_default_access("admins", "can_edit", ["all"])
        .with_default_access("users", "can_edit", ["own"])
        .with_default_access("users", "can_view", [""])
        .with_default_access("leads", "can_edit", ["team"])
}

fn config_builder() -> restraint_core::rbac::RestraintConfigBuilder<User> {
    RestraintConfig::builder(schema())
        .perm_set_getter(|user: &User| user.roles.iter().map(|r| r.to_string()).collect())
        .level_filter("can_edit", "own", LevelFilter::scoped_fn(|user: &User| Ok(vec![user.id])))
        .level_filter("can_edit", "team", LevelFilter::scoped_fn(|_: &User| Ok(vec![3, 4])))
}

async fn setup() -> (Arc<RestraintConfig<User>>, Arc<MemoryAccessStore>) {
    let store = Arc::new(MemoryAccessStore::new());
    SyncEngine::new(store.clone()).reconcile(&schema(), false).await.unwrap();
    (Arc::new(config_builder().build().unwrap()), store)
}

fn restraint(config: &Arc<RestraintConfig<User>>, store: &Arc<MemoryAccessStore>, user: User) -> Restraint<User> {
    Restraint::new(config.clone(), store.clone(), user)
}

/// Counts reads that reach the store.
struct CountingStore {
    inner: MemoryAccessStore,
    reads: AtomicUsize,
}

#[async_trait]
impl AccessStore for CountingStore {
    async fn begin(&self) -> Result<Box<dyn AccessTransaction>> {
        self.inner.begin().await
    }

    async fn granted_levels(
        &self,
        perm_sets: &[String],
        subject: &SubjectKey,
        perms: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<GrantedLevel>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.granted_levels(perm_sets, subject, perms).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concrete Scenario
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_users_see_only_their_own() {
    let (config, store) = setup().await;
    let out = restraint(&config, &store, User::new(2, &["users"]))
        .filter(vec![1, 2, 3], "can_edit")
        .await
        .unwrap();
    assert_eq!(out, vec![2]);
}

#[tokio::test]
async fn test_admins_see_everything() {
    let (config, store) = setup().await;
    let out = restraint(&config, &store, User::new(2, &["admins"]))
        .filter(vec![1, 2, 3], "can_edit")
        .await
        .unwrap();
    assert_eq!(out, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_outsiders_see_nothing() {
    let (config, store) = setup().await;
    let out = restraint(&config, &store, User::new(2, &[]))
        .filter(vec![1, 2, 3], "can_edit")
        .await
        .unwrap();
    assert!(out.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_resolution_unions_sets() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users", "leads"]));

    let names = r.perms().await.unwrap().names();
    let can_edit: Vec<&str> = names["can_edit"].iter().map(String::as_str).collect();
    assert_eq!(can_edit, vec!["own", "team"]);
    assert!(names.contains_key("can_view"));
}

#[tokio::test]
async fn test_individual_grants_only_add() {
    let (config, store) = setup().await;
    let user = User::new(2, &["users"]);
    AccessAdmin::new(store.clone())
        .grant_individual_access(&user.subject_key(), "can_delete", "")
        .await
        .unwrap();

    let r = restraint(&config, &store, user);
    assert!(r.has_perm("can_delete", None).await.unwrap());
    assert!(r.has_perm("can_edit", Some("own")).await.unwrap());
    assert!(r.has_perm("can_view", Some("")).await.unwrap());
}

#[tokio::test]
async fn test_has_perm_with_and_without_level() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users"]));

    assert!(r.has_perm("can_edit", None).await.unwrap());
    assert!(r.has_perm("can_edit", Some("own")).await.unwrap());
    assert!(!r.has_perm("can_edit", Some("all")).await.unwrap());
    assert!(!r.has_perm("can_delete", None).await.unwrap());
    assert!(!r.has_perm("unknown", None).await.unwrap());
}

#[tokio::test]
async fn test_perm_filter_limits_map() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users"])).with_perm_filter(["can_view"]);

    let perms = r.perms().await.unwrap();
    assert_eq!(perms.len(), 1);
    assert!(perms.contains_level("can_view", ""));
    assert!(!r.has_perm("can_edit", None).await.unwrap());
}

#[tokio::test]
async fn test_map_is_loaded_once() {
    let inner = MemoryAccessStore::new();
    SyncEngine::new(Arc::new(inner.clone())).reconcile(&schema(), false).await.unwrap();
    let store = Arc::new(CountingStore {
        inner,
        reads: AtomicUsize::new(0),
    });
    let config = Arc::new(config_builder().build().unwrap());

    let r = Restraint::new(config, store.clone(), User::new(2, &["users"]));
    r.has_perm("can_edit", None).await.unwrap();
    r.has_perm("can_view", Some("")).await.unwrap();
    r.filter(vec![1, 2, 3], "can_edit").await.unwrap();

    assert_eq!(store.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_from_registry() {
    let (_config, store) = setup().await;
    let registry: ConfigRegistry<User> = ConfigRegistry::new();

    let err = Restraint::from_registry(&registry, store.clone(), User::new(1, &[])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationMissing);

    registry.register(config_builder().build().unwrap()).unwrap();
    let r = Restraint::from_registry(&registry, store, User::new(1, &["admins"])).unwrap();
    assert!(r.has_perm("can_edit", Some("all")).await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkers
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_custom_checker_short_circuits() {
    let store = Arc::new(MemoryAccessStore::new());
    SyncEngine::new(store.clone()).reconcile(&schema(), false).await.unwrap();
    let config = config_builder()
        .checker(FnChecker(
            |user: &User, _: &PermissionMap<User>, _: &str, _: Option<&str>| user.superuser,
        ))
        .build()
        .unwrap();

    let mut root = User::new(9, &[]);
    root.superuser = true;
    let r = Restraint::new(Arc::new(config), store, root);

    assert!(r.has_perm("can_delete", None).await.unwrap());
    // A checker can grant a perm with no loaded levels; filtering allows all.
    assert_eq!(r.filter(vec![1, 2], "can_delete").await.unwrap(), vec![1, 2]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filter Decision Table
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_missing_perm_with_restriction_excludes_subset() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &[]));

    let out = r
        .filter_restricted(vec![1, 2, 3, 4], "can_edit", |id: &EntityId| *id > 2)
        .await
        .unwrap();
    assert_eq!(out, vec![1, 2]);
}

#[tokio::test]
async fn test_held_perm_with_restriction_narrows_subset_only() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(4, &["users"]));

    let out = r
        .filter_restricted(vec![1, 2, 3, 4], "can_edit", |id: &EntityId| *id > 2)
        .await
        .unwrap();
    assert_eq!(out, vec![1, 2, 4]);
}

#[tokio::test]
async fn test_unrestricted_level_wins_over_scoped() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users", "admins"]));

    let out = r.filter(vec![1, 2, 3, 4, 5], "can_edit").await.unwrap();
    assert_eq!(out, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_scoped_levels_union() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users", "leads"]));

    let out = r.filter(vec![1, 2, 3, 4, 5], "can_edit").await.unwrap();
    assert_eq!(out, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_boolean_perm_is_unrestricted() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users"]));

    let out = r.filter(vec![7, 8], "can_view").await.unwrap();
    assert_eq!(out, vec![7, 8]);
}

#[tokio::test]
async fn test_records_filter_by_id() {
    let (config, store) = setup().await;
    let r = restraint(&config, &store, User::new(2, &["users"]));

    let accounts = vec![Record::new(1, "alpha"), Record::new(2, "beta")];
    let out = r.filter(accounts, "can_edit").await.unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].data, "beta");
}

#[tokio::test]
async fn test_failing_level_filter_propagates() {
    let store = Arc::new(MemoryAccessStore::new());
    SyncEngine::new(store.clone()).reconcile(&schema(), false).await.unwrap();
    let config = RestraintConfig::builder(schema())
        .perm_set_getter(|user: &User| user.roles.iter().map(|r| r.to_string()).collect())
        .level_filter(
            "can_edit",
            "own",
            LevelFilter::scoped_fn(|_: &User| Err(RestraintError::predicate_failed("can_edit", "own", "lookup failed"))),
        )
        .build()
        .unwrap();

    let r = Restraint::new(Arc::new(config), store, User::new(2, &["users"]));
    let err = r.filter(vec![1, 2], "can_edit").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PredicateFailed);
}
