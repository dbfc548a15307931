//! The analyst's choice of which groups count as priority population.

use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{ConfigurationError, Notice};
use crate::types::Group;

/// Non-empty set of known groups. Construction is the only validation point,
/// so every `GroupSelection` in circulation is usable for ranking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupSelection(BTreeSet<Group>);

impl GroupSelection {
    pub fn new(groups: impl IntoIterator<Item = Group>) -> Result<Self, ConfigurationError> {
        let set: BTreeSet<Group> = groups.into_iter().collect();
        if set.is_empty() {
            return Err(ConfigurationError::EmptySelection);
        }
        Ok(GroupSelection(set))
    }

    /// Parses a list such as `"A,B,C"` or `"A+B"`.
    pub fn parse(input: &str) -> Result<Self, ConfigurationError> {
        let groups = input
            .split(|c: char| c == ',' || c == '+' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse::<Group>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(groups)
    }

    /// Rejects groups the dataset has no column for.
    pub fn check_available(&self, available: &BTreeSet<Group>) -> Result<(), ConfigurationError> {
        match self.0.iter().find(|g| !available.contains(g)) {
            Some(g) => Err(ConfigurationError::UnavailableGroup(*g)),
            None => Ok(()),
        }
    }

    /// Validates `requested` against the dataset, falling back to the default
    /// selection (restricted to available groups) on any configuration error.
    pub fn resolve(
        requested: Option<&str>,
        available: &BTreeSet<Group>,
    ) -> (GroupSelection, Option<Notice>) {
        let Some(input) = requested else {
            return (Self::default_for(available), None);
        };
        let attempt = Self::parse(input).and_then(|sel| {
            sel.check_available(available)?;
            Ok(sel)
        });
        match attempt {
            Ok(sel) => (sel, None),
            Err(e) => {
                let fallback = Self::default_for(available);
                tracing::warn!("Rejected group selection {:?}: {}; using {}", input, e, fallback);
                let notice = Notice::SelectionSubstituted {
                    reason: e.to_string(),
                    used: fallback.to_string(),
                };
                (fallback, Some(notice))
            }
        }
    }

    /// Default restricted to what the dataset provides. Falls back to every
    /// available group when none of the default groups are present.
    pub fn default_for(available: &BTreeSet<Group>) -> GroupSelection {
        let default = GroupSelection::default();
        let kept: BTreeSet<Group> = default.0.intersection(available).copied().collect();
        if !kept.is_empty() {
            return GroupSelection(kept);
        }
        GroupSelection::new(available.iter().copied()).unwrap_or(default)
    }

    pub fn contains(&self, group: Group) -> bool {
        self.0.contains(&group)
    }

    pub fn iter(&self) -> impl Iterator<Item = Group> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact label for file names, e.g. `ABC`.
    pub fn compact(&self) -> String {
        self.iter().map(Group::letter).collect()
    }

    /// Saturates instead of overflowing.
    pub fn sum(&self, counts: &[u64; 4]) -> u64 {
        self.iter().fold(0, |acc: u64, g| acc.saturating_add(counts[g.index()]))
    }
}

/// The three most vulnerable groups.
impl Default for GroupSelection {
    fn default() -> Self {
        GroupSelection([Group::A, Group::B, Group::C].into_iter().collect())
    }
}

impl fmt::Display for GroupSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letters: Vec<&str> = self.iter().map(Group::letter).collect();
        f.write_str(&letters.join("+"))
    }
}

impl Serialize for GroupSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(Group::letter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> BTreeSet<Group> {
        Group::ALL.into_iter().collect()
    }

    #[test]
    fn empty_selection_is_rejected() {
        assert_eq!(
            GroupSelection::new(Vec::<Group>::new()),
            Err(ConfigurationError::EmptySelection)
        );
        assert_eq!(
            GroupSelection::parse(" , "),
            Err(ConfigurationError::EmptySelection)
        );
    }

    #[test]
    fn parse_accepts_separators_and_dedups() {
        let sel = GroupSelection::parse("c+A, a").unwrap();
        assert_eq!(sel.to_string(), "A+C");
        assert_eq!(sel.compact(), "AC");
        assert_eq!(sel.len(), 2);
    }

    #[test]
    fn unknown_group_substitutes_default_with_notice() {
        let (sel, notice) = GroupSelection::resolve(Some("A,Z"), &all());
        assert_eq!(sel, GroupSelection::default());
        match notice {
            Some(Notice::SelectionSubstituted { reason, used }) => {
                assert!(reason.contains("'Z'"));
                assert_eq!(used, "A+B+C");
            }
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[test]
    fn empty_request_substitutes_default() {
        let (sel, notice) = GroupSelection::resolve(Some(""), &all());
        assert_eq!(sel.compact(), "ABC");
        assert!(notice.is_some());
    }

    #[test]
    fn missing_request_uses_default_silently() {
        let (sel, notice) = GroupSelection::resolve(None, &all());
        assert_eq!(sel.compact(), "ABC");
        assert!(notice.is_none());
    }

    #[test]
    fn unavailable_group_is_a_configuration_error() {
        let available: BTreeSet<Group> = [Group::A, Group::B].into_iter().collect();
        let sel = GroupSelection::parse("A,D").unwrap();
        assert_eq!(
            sel.check_available(&available),
            Err(ConfigurationError::UnavailableGroup(Group::D))
        );
        let (fallback, _) = GroupSelection::resolve(Some("A,D"), &available);
        assert_eq!(fallback.compact(), "AB");
    }

    #[test]
    fn default_falls_back_to_available_groups() {
        let available: BTreeSet<Group> = [Group::D].into_iter().collect();
        assert_eq!(GroupSelection::default_for(&available).compact(), "D");
    }

    #[test]
    fn sums_only_selected_columns() {
        let sel = GroupSelection::parse("A,C").unwrap();
        assert_eq!(sel.sum(&[1, 10, 100, 1000]), 101);
    }
}
