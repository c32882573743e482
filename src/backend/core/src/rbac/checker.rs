//! Pluggable permission checkers consulted in order; the first `true` wins.

use std::fmt;
use std::sync::Arc;

use super::models::Subject;
use super::policy::PermissionMap;

/// A boolean predicate over a resolved permission map.
pub trait PermChecker<S: Subject>: Send + Sync {
    fn check(&self, subject: &S, perms: &PermissionMap<S>, perm: &str, level: Option<&str>) -> bool;
}

/// The default checker.
///
/// With a level: the permission holds that exact level. Without one: the
/// permission holds at least one level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelChecker;

impl<S: Subject> PermChecker<S> for LevelChecker {
    fn check(&self, _subject: &S, perms: &PermissionMap<S>, perm: &str, level: Option<&str>) -> bool {
        match level {
            Some(level) => perms.contains_level(perm, level),
            None => perms.contains_perm(perm),
        }
    }
}

/// Adapts a plain function into a [`PermChecker`].
pub struct FnChecker<F>(pub F);

impl<S, F> PermChecker<S> for FnChecker<F>
where
    S: Subject,
    F: Fn(&S, &PermissionMap<S>, &str, Option<&str>) -> bool + Send + Sync,
{
    fn check(&self, subject: &S, perms: &PermissionMap<S>, perm: &str, level: Option<&str>) -> bool {
        (self.0)(subject, perms, perm, level)
    }
}

/// Ordered checkers combined with short-circuit OR.
pub struct CheckerChain<S: Subject> {
    checkers: Vec<Arc<dyn PermChecker<S>>>,
}

impl<S: Subject> CheckerChain<S> {
    /// A chain holding only [`LevelChecker`].
    pub fn new() -> Self {
        let mut chain = Self::empty();
        chain.push(LevelChecker);
        chain
    }

    pub fn empty() -> Self {
        Self { checkers: Vec::new() }
    }

    pub fn push(&mut self, checker: impl PermChecker<S> + 'static) {
        self.checkers.push(Arc::new(checker));
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// True on the first checker that returns true; false if none do.
    pub fn check(&self, subject: &S, perms: &PermissionMap<S>, perm: &str, level: Option<&str>) -> bool {
        self.checkers
            .iter()
            .any(|checker| checker.check(subject, perms, perm, level))
    }
}

impl<S: Subject> Default for CheckerChain<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subject> Clone for CheckerChain<S> {
    fn clone(&self) -> Self {
        Self {
            checkers: self.checkers.clone(),
        }
    }
}

impl<S: Subject> fmt::Debug for CheckerChain<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckerChain")
            .field("len", &self.checkers.len())
            .finish()
    }
}
