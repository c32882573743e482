//! Access control: the declared permission taxonomy, per-subject
//! resolution, checking and result filtering.
//!
//! This module provides:
//! - **Models**: permission sets, permissions, levels, grants and subjects
//! - **Declaration**: the schema plus executable level filters and checkers
//! - **Resolver**: [`Restraint`], a memoized permission map for one subject
//! - **Checkers**: pluggable predicates consulted in order
//! - **Filter**: narrowing candidate collections by a permission
//! - **Admin**: operator changes to live grants
//!
//! # Usage
//!
//! ```rust,ignore
//! use restraint_core::rbac::{DeclaredSchema, LevelFilter, PermDecl, RestraintConfig, Restraint};
//!
//! let schema = DeclaredSchema::new()
//!     .with_perm_set("admins", PermSetDecl::new("Admins"))
//!     .with_perm("can_edit", PermDecl::new("Can Edit").with_level("all", "All").with_level("own", "Own"))
//!     .with_default_access("admins", "can_edit", ["all"]);
//!
//! let config = RestraintConfig::builder(schema)
//!     .perm_set_getter(|user: &User| user.roles())
//!     .level_filter("can_edit", "own", LevelFilter::scoped_fn(|user: &User| Ok(vec![user.id])))
//!     .build()?;
//!
//! let restraint = Restraint::new(Arc::new(config), store, user);
//! let editable = restraint.filter(ids, "can_edit").await?;
//! ```

pub mod admin;
pub mod checker;
pub mod declaration;
pub mod filter;
pub mod models;
pub mod policy;

pub use admin::AccessAdmin;
pub use checker::{CheckerChain, FnChecker, LevelChecker, PermChecker};
pub use declaration::{
    ConfigRegistry, DeclaredSchema, FnFilter, IdFilter, LevelDecl, LevelFilter, PermDecl, PermSetDecl,
    RestraintConfig, RestraintConfigBuilder,
};
pub use filter::{Candidate, FilterDecision};
pub use models::{
    AccessGraph, AccessGrant, EntityId, GrantHolder, GrantSummary, GrantedLevel, HolderName, Perm, PermLevel,
    PermSet, PermSummary, Record, RecordId, Subject, SubjectKey, BOOLEAN_LEVEL,
};
pub use policy::{PermissionMap, Restraint};
