#![allow(clippy::result_large_err)]
//! # Restraint Core
//!
//! Declarative access control: a permission taxonomy reconciled into a
//! persisted authorization graph, resolved per subject at request time.
//!
//! ## Architecture
//!
//! - **Access Store**: transactional persistence for sets, perms, levels and grants (memory or PostgreSQL)
//! - **Sync Engine**: reconciles a declared schema into the store, additive by default
//! - **Resolver**: memoized per-subject permission map merging set and individual grants
//! - **Checker Chain**: pluggable predicates consulted in order
//! - **Result Filter**: allow all, none, or the union of scoped level filters
//! - **Admin**: operator changes to live grants
//! - **Telemetry**: structured logging and metrics

pub mod config;
pub mod db;
pub mod error;
pub mod rbac;
pub mod sync;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, RestraintError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::db::{AccessStore, AccessTransaction, MemoryAccessStore, PgAccessStore};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, RestraintError, Result};
    pub use crate::rbac::{
        AccessAdmin, AccessGraph, Candidate, CheckerChain, ConfigRegistry, DeclaredSchema, EntityId, FnChecker,
        GrantedLevel, LevelFilter, PermChecker, PermDecl, PermSetDecl, PermissionMap, Restraint, RestraintConfig,
        Subject, SubjectKey, BOOLEAN_LEVEL,
    };
    pub use crate::sync::{NewLevelPolicy, ReconcileOptions, ReconciliationReport, SyncEngine};
}
