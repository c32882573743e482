//! Authorization graph data models: permission sets, permissions, levels,
//! access grants and subject addressing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Primary key of a persisted row.
pub type RecordId = i64;

/// Identifier of a candidate entity passed through the result filter.
pub type EntityId = i64;

/// Name of the single level carried by a boolean (unscoped) permission.
pub const BOOLEAN_LEVEL: &str = "";

/// A persisted row: the store-assigned id plus the row data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: RecordId,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Record<T> {
    pub fn new(id: RecordId, data: T) -> Self {
        Self { id, data }
    }
}

impl<T> Deref for Record<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema Rows
// ═══════════════════════════════════════════════════════════════════════════════

/// A named group of subjects used as the unit of default access.
///
/// Private sets are owned by the sync engine; user-created sets are never
/// touched by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermSet {
    pub name: String,
    pub display_name: String,
    pub is_private: bool,
    pub is_locked: bool,
    pub is_hidden: bool,
}

impl fmt::Display for PermSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.display_name, self.name)
    }
}

/// A named capability, e.g. `can_edit_accounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perm {
    pub name: String,
    pub display_name: String,
    pub is_locked: bool,
    pub is_hidden: bool,
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.display_name, self.name)
    }
}

/// A named scope within a permission, unique per `(perm_id, name)`.
///
/// The empty name ([`BOOLEAN_LEVEL`]) marks an all-or-nothing permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermLevel {
    pub perm_id: RecordId,
    pub name: String,
    pub display_name: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subjects
// ═══════════════════════════════════════════════════════════════════════════════

/// Address of an individual subject: a registered subject type plus its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub subject_type: String,
    pub subject_id: i64,
}

impl SubjectKey {
    pub fn new(subject_type: impl Into<String>, subject_id: i64) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// Anything permissions can be resolved for.
///
/// Implementors state their own address; restraint never inspects the
/// concrete type.
pub trait Subject: Send + Sync {
    fn subject_key(&self) -> SubjectKey;
}

impl Subject for SubjectKey {
    fn subject_key(&self) -> SubjectKey {
        self.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Access Grants
// ═══════════════════════════════════════════════════════════════════════════════

/// Who an access grant is addressed to. The two modes are exclusive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrantHolder {
    PermSet { perm_set_id: RecordId },
    Subject { subject: SubjectKey },
}

impl GrantHolder {
    pub fn perm_set(perm_set_id: RecordId) -> Self {
        Self::PermSet { perm_set_id }
    }

    pub fn subject(subject: SubjectKey) -> Self {
        Self::Subject { subject }
    }
}

/// The set of levels held by one grant holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub holder: GrantHolder,
    pub level_ids: BTreeSet<RecordId>,
}

impl AccessGrant {
    pub fn empty(holder: GrantHolder) -> Self {
        Self {
            holder,
            level_ids: BTreeSet::new(),
        }
    }
}

/// A `(permission, level)` name pair reachable through some grant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantedLevel {
    pub perm: String,
    pub level: String,
}

impl GrantedLevel {
    pub fn new(perm: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            perm: perm.into(),
            level: level.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Name-level view of a permission with its levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermSummary {
    pub name: String,
    pub display_name: String,
    pub is_locked: bool,
    pub is_hidden: bool,
    pub levels: BTreeSet<String>,
}

/// Name-level view of a grant holder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HolderName {
    PermSet { name: String },
    Subject { subject: SubjectKey },
}

impl fmt::Display for HolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermSet { name } => write!(f, "set:{}", name),
            Self::Subject { subject } => write!(f, "subject:{}", subject),
        }
    }
}

/// Name-level view of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSummary {
    pub holder: HolderName,
    pub levels: BTreeSet<GrantedLevel>,
}

/// The whole persisted graph expressed by names only, so two snapshots can
/// be compared regardless of row ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGraph {
    pub perm_sets: Vec<PermSet>,
    pub perms: Vec<PermSummary>,
    pub grants: Vec<GrantSummary>,
    pub captured_at: DateTime<Utc>,
}

impl AccessGraph {
    /// Compare two snapshots ignoring capture time.
    pub fn same_graph(&self, other: &AccessGraph) -> bool {
        self.perm_sets == other.perm_sets && self.perms == other.perms && self.grants == other.grants
    }

    /// Levels held by a permission set, if the set has a grant.
    pub fn set_levels(&self, set_name: &str) -> Option<&BTreeSet<GrantedLevel>> {
        self.grants.iter().find_map(|g| match &g.holder {
            HolderName::PermSet { name } if name == set_name => Some(&g.levels),
            _ => None,
        })
    }

    /// Levels held individually by a subject, if it has a grant.
    pub fn subject_levels(&self, key: &SubjectKey) -> Option<&BTreeSet<GrantedLevel>> {
        self.grants.iter().find_map(|g| match &g.holder {
            HolderName::Subject { subject } if subject == key => Some(&g.levels),
            _ => None,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
