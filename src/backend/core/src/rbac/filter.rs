//! Result filtering: narrow a candidate collection to what a resolved
//! permission allows.
//!
//! Decision order:
//! 1. Permission not held: drop the restricted subset if a restriction was
//!    given, otherwise drop everything.
//! 2. Any held level is unrestricted: keep everything.
//! 3. Otherwise keep the union of the ids every scoped level yields. With a
//!    restriction, only the restricted subset is narrowed.

use std::collections::BTreeSet;

use super::models::{EntityId, Record};

/// Something the result filter can identify.
pub trait Candidate {
    fn candidate_id(&self) -> EntityId;
}

impl Candidate for EntityId {
    fn candidate_id(&self) -> EntityId {
        *self
    }
}

impl<T> Candidate for Record<T> {
    fn candidate_id(&self) -> EntityId {
        self.id
    }
}

/// The outcome of evaluating a permission for filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// The permission is not held.
    Deny,
    /// At least one held level is unrestricted.
    AllowAll,
    /// Only these ids are allowed.
    AllowIds(BTreeSet<EntityId>),
}

impl FilterDecision {
    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::AllowAll => "allow_all",
            Self::AllowIds(_) => "allow_ids",
        }
    }

    /// Apply the decision to `candidates`.
    ///
    /// `restrict_to` selects the candidates this permission governs; the
    /// others pass through untouched. `None` means it governs all of them.
    pub fn apply<T, R>(&self, candidates: Vec<T>, restrict_to: Option<R>) -> Vec<T>
    where
        T: Candidate,
        R: Fn(&T) -> bool,
    {
        let governed = |c: &T| restrict_to.as_ref().map_or(true, |r| r(c));

        match self {
            Self::AllowAll => candidates,
            Self::Deny => candidates.into_iter().filter(|c| !governed(c)).collect(),
            Self::AllowIds(ids) => candidates
                .into_iter()
                .filter(|c| !governed(c) || ids.contains(&c.candidate_id()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Unrestricted = fn(&EntityId) -> bool;

    #[test]
    fn test_deny_without_restriction_is_empty() {
        let out = FilterDecision::Deny.apply(vec![1, 2, 3], None::<Unrestricted>);
        assert!(out.is_empty());
    }

    #[test]
    fn test_deny_with_restriction_excludes_subset() {
        let out = FilterDecision::Deny.apply(vec![1, 2, 3, 4], Some(|id: &EntityId| id % 2 == 0));
        assert_eq!(out, vec![1, 3]);
    }

    #[test]
    fn test_allow_all_keeps_everything() {
        let out = FilterDecision::AllowAll.apply(vec![1, 2, 3], None::<Unrestricted>);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_allow_ids_is_a_membership_filter() {
        let ids: BTreeSet<EntityId> = [2, 3, 9].into_iter().collect();
        let out = FilterDecision::AllowIds(ids).apply(vec![1, 2, 3, 4], None::<Unrestricted>);
        assert_eq!(out, vec![2, 3]);
    }

    #[test]
    fn test_allow_ids_with_restriction_only_narrows_subset() {
        let ids: BTreeSet<EntityId> = [2].into_iter().collect();
        let out = FilterDecision::AllowIds(ids).apply(vec![1, 2, 3, 4], Some(|id: &EntityId| *id >= 2));
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_records_are_candidates() {
        let records = vec![Record::new(5, "five"), Record::new(6, "six")];
        let ids: BTreeSet<EntityId> = [6].into_iter().collect();
        let out = FilterDecision::AllowIds(ids).apply(records, None::<fn(&Record<&str>) -> bool>);
        assert_eq!(out.len(), 1);
        assert_eq!(*out[0], "six");
    }
}
