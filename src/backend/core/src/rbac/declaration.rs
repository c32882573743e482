//! Declared configuration: the permission taxonomy as data, plus the
//! executable bindings (set membership, level filters, checkers) that only
//! live in memory.
//!
//! The store only ever persists names. Everything executable is held here,
//! keyed by `(perm, level)` name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use super::checker::{CheckerChain, PermChecker};
use super::models::{EntityId, Subject, BOOLEAN_LEVEL};
use crate::error::{ErrorCode, RestraintError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Declarations
// ═══════════════════════════════════════════════════════════════════════════════

/// A declared permission set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermSetDecl {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl PermSetDecl {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// A declared level of a permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDecl {
    #[serde(default)]
    pub display_name: String,
}

/// A declared permission.
///
/// `levels: None` means a boolean permission with the single
/// [`BOOLEAN_LEVEL`]. `Some` with an empty map is rejected by
/// [`DeclaredSchema::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermDecl {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<BTreeMap<String, LevelDecl>>,
}

impl PermDecl {
    /// A boolean permission.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Add a named level. The first call turns a boolean permission into a
    /// scoped one.
    pub fn with_level(mut self, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.levels.get_or_insert_with(BTreeMap::new).insert(
            name.into(),
            LevelDecl {
                display_name: display_name.into(),
            },
        );
        self
    }

    /// Declare an explicitly empty level set (always invalid; kept so callers
    /// can express what a config file says).
    pub fn without_levels(mut self) -> Self {
        self.levels = Some(BTreeMap::new());
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// The levels this permission owns once persisted.
    pub fn effective_levels(&self) -> Cow<'_, BTreeMap<String, LevelDecl>> {
        match &self.levels {
            Some(levels) => Cow::Borrowed(levels),
            None => Cow::Owned(boolean_levels()),
        }
    }
}

/// The level map of a boolean permission.
pub fn boolean_levels() -> BTreeMap<String, LevelDecl> {
    let mut levels = BTreeMap::new();
    levels.insert(BOOLEAN_LEVEL.to_string(), LevelDecl::default());
    levels
}

/// The declarative permission taxonomy.
///
/// Pure data: deserializable from TOML/JSON and consumed by the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredSchema {
    #[serde(default)]
    pub perm_sets: BTreeMap<String, PermSetDecl>,
    #[serde(default)]
    pub perms: BTreeMap<String, PermDecl>,
    /// set name -> perm name -> level names
    #[serde(default)]
    pub default_access: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl DeclaredSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_perm_set(mut self, name: impl Into<String>, decl: PermSetDecl) -> Self {
        self.perm_sets.insert(name.into(), decl);
        self
    }

    pub fn with_perm(mut self, name: impl Into<String>, decl: PermDecl) -> Self {
        self.perms.insert(name.into(), decl);
        self
    }

    pub fn with_default_access<I, L>(
        mut self,
        set: impl Into<String>,
        perm: impl Into<String>,
        levels: I,
    ) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.default_access
            .entry(set.into())
            .or_default()
            .insert(perm.into(), levels.into_iter().map(Into::into).collect());
        self
    }

    /// Check structural invariants before anything touches the store.
    ///
    /// Returns the first violation, naming the offending declaration.
    pub fn validate(&self) -> Result<()> {
        for (name, perm) in &self.perms {
            if perm.levels.as_ref().is_some_and(|levels| levels.is_empty()) {
                return Err(RestraintError::configuration_invalid(
                    "perm",
                    name,
                    "declares an empty level set",
                ));
            }
        }

        for (set_name, entries) in &self.default_access {
            // Only declared sets are reconciled; entries for anything else are inert.
            if !self.perm_sets.contains_key(set_name) {
                warn!(perm_set = %set_name, "Ignoring default access for undeclared permission set");
                continue;
            }
            for (perm_name, level_names) in entries {
                let path = format!("{}.{}", set_name, perm_name);
                let Some(perm) = self.perms.get(perm_name) else {
                    return Err(RestraintError::configuration_invalid(
                        "default_access",
                        path,
                        "references an undeclared permission",
                    ));
                };
                if level_names.is_empty() {
                    return Err(RestraintError::configuration_invalid(
                        "default_access",
                        path,
                        "declares no levels",
                    ));
                }
                let declared = perm.effective_levels();
                if let Some(unknown) = level_names.iter().find(|l| !declared.contains_key(*l)) {
                    return Err(RestraintError::configuration_invalid(
                        "default_access",
                        format!("{}.{}", path, unknown),
                        "references an undeclared level",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Whether `(perm, level)` is declared.
    pub fn declares_level(&self, perm: &str, level: &str) -> bool {
        self.perms
            .get(perm)
            .is_some_and(|decl| decl.effective_levels().contains_key(level))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Level Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps a subject to the entity ids one level permits.
#[async_trait]
pub trait IdFilter<S: Subject>: Send + Sync {
    async fn allowed_ids(&self, subject: &S) -> Result<BTreeSet<EntityId>>;
}

/// Adapts a plain function into an [`IdFilter`].
pub struct FnFilter<F>(pub F);

#[async_trait]
impl<S, F> IdFilter<S> for FnFilter<F>
where
    S: Subject,
    F: Fn(&S) -> Result<Vec<EntityId>> + Send + Sync,
{
    async fn allowed_ids(&self, subject: &S) -> Result<BTreeSet<EntityId>> {
        Ok((self.0)(subject)?.into_iter().collect())
    }
}

/// What a granted level lets a subject reach.
pub enum LevelFilter<S: Subject> {
    /// Every candidate, regardless of other levels held.
    Unrestricted,
    /// Only the ids the filter yields for the subject.
    Scoped(Arc<dyn IdFilter<S>>),
}

impl<S: Subject> LevelFilter<S> {
    pub fn scoped(filter: impl IdFilter<S> + 'static) -> Self {
        Self::Scoped(Arc::new(filter))
    }

    pub fn scoped_fn<F>(f: F) -> Self
    where
        F: Fn(&S) -> Result<Vec<EntityId>> + Send + Sync + 'static,
    {
        Self::scoped(FnFilter(f))
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }
}

impl<S: Subject> Clone for LevelFilter<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Unrestricted => Self::Unrestricted,
            Self::Scoped(filter) => Self::Scoped(Arc::clone(filter)),
        }
    }
}

impl<S: Subject> fmt::Debug for LevelFilter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => f.write_str("Unrestricted"),
            Self::Scoped(_) => f.write_str("Scoped(..)"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime Configuration
// ═══════════════════════════════════════════════════════════════════════════════

type PermSetGetter<S> = Arc<dyn Fn(&S) -> Vec<String> + Send + Sync>;

/// Declared schema plus the executable bindings for subject type `S`.
pub struct RestraintConfig<S: Subject> {
    schema: DeclaredSchema,
    perm_set_getter: PermSetGetter<S>,
    filters: HashMap<(String, String), LevelFilter<S>>,
    checkers: CheckerChain<S>,
}

impl<S: Subject> RestraintConfig<S> {
    pub fn builder(schema: DeclaredSchema) -> RestraintConfigBuilder<S> {
        RestraintConfigBuilder {
            schema,
            perm_set_getter: None,
            filters: HashMap::new(),
            checkers: CheckerChain::new(),
        }
    }

    pub fn schema(&self) -> &DeclaredSchema {
        &self.schema
    }

    /// Permission sets the subject belongs to.
    pub fn perm_sets_for(&self, subject: &S) -> Vec<String> {
        (self.perm_set_getter)(subject)
    }

    /// The filter bound to `(perm, level)`; unbound levels are unrestricted.
    pub fn level_filter(&self, perm: &str, level: &str) -> LevelFilter<S> {
        self.filters
            .get(&(perm.to_string(), level.to_string()))
            .cloned()
            .unwrap_or(LevelFilter::Unrestricted)
    }

    pub fn checkers(&self) -> &CheckerChain<S> {
        &self.checkers
    }
}

impl<S: Subject> fmt::Debug for RestraintConfig<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestraintConfig")
            .field("schema", &self.schema)
            .field("filters", &self.filters.len())
            .field("checkers", &self.checkers.len())
            .finish()
    }
}

/// Builder for [`RestraintConfig`].
pub struct RestraintConfigBuilder<S: Subject> {
    schema: DeclaredSchema,
    perm_set_getter: Option<PermSetGetter<S>>,
    filters: HashMap<(String, String), LevelFilter<S>>,
    checkers: CheckerChain<S>,
}

impl<S: Subject> RestraintConfigBuilder<S> {
    /// The set-membership function. Required.
    pub fn perm_set_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn(&S) -> Vec<String> + Send + Sync + 'static,
    {
        self.perm_set_getter = Some(Arc::new(getter));
        self
    }

    pub fn level_filter(
        mut self,
        perm: impl Into<String>,
        level: impl Into<String>,
        filter: LevelFilter<S>,
    ) -> Self {
        self.filters.insert((perm.into(), level.into()), filter);
        self
    }

    /// Append a checker after the ones already registered.
    pub fn checker(mut self, checker: impl PermChecker<S> + 'static) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn build(self) -> Result<RestraintConfig<S>> {
        self.schema.validate()?;

        let perm_set_getter = self.perm_set_getter.ok_or_else(|| {
            RestraintError::configuration_invalid(
                "config",
                "perm_set_getter",
                "a set-membership function is required",
            )
        })?;

        if let Some((perm, level)) = self
            .filters
            .keys()
            .find(|(perm, level)| !self.schema.declares_level(perm, level))
        {
            return Err(RestraintError::configuration_invalid(
                "level_filter",
                format!("{}.{}", perm, level),
                "is bound to an undeclared level",
            ));
        }

        debug!(
            perm_sets = self.schema.perm_sets.len(),
            perms = self.schema.perms.len(),
            filters = self.filters.len(),
            "Built restraint configuration"
        );

        Ok(RestraintConfig {
            schema: self.schema,
            perm_set_getter,
            filters: self.filters,
            checkers: self.checkers,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Holds the configuration registered once at process start.
pub struct ConfigRegistry<S: Subject> {
    slot: OnceLock<Arc<RestraintConfig<S>>>,
}

impl<S: Subject> ConfigRegistry<S> {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Register the configuration. Fails if one is already registered.
    pub fn register(&self, config: RestraintConfig<S>) -> Result<Arc<RestraintConfig<S>>> {
        let config = Arc::new(config);
        self.slot.set(Arc::clone(&config)).map_err(|_| {
            RestraintError::new(
                ErrorCode::ConfigurationInvalid,
                "A restraint configuration is already registered",
            )
        })?;
        Ok(config)
    }

    /// The registered configuration, or ConfigurationMissing.
    pub fn get(&self) -> Result<Arc<RestraintConfig<S>>> {
        self.slot
            .get()
            .cloned()
            .ok_or_else(RestraintError::configuration_missing)
    }

    pub fn is_registered(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<S: Subject> Default for ConfigRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
