//! Voting membership.

use super::types::{ConfChangeKind, MemberInfo, NodeId};
use crate::core::error::{TesseraError, TesseraResult};
use std::collections::BTreeMap;

/// The current voter set. Changes only when a configuration-change entry
/// commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: BTreeMap<NodeId, MemberInfo>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = MemberInfo>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&MemberInfo> {
        self.members.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Votes (or acknowledgements) needed for a majority.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn to_vec(&self) -> Vec<MemberInfo> {
        self.members.values().cloned().collect()
    }

    /// Check that a change makes sense against the current set.
    pub fn validate(&self, change: &ConfChangeKind) -> TesseraResult<()> {
        match change {
            ConfChangeKind::AddMember(m) if self.contains(m.id) => {
                Err(TesseraError::MemberExists { member_id: m.id })
            }
            ConfChangeKind::AddMember(m) if m.id == 0 => {
                Err(TesseraError::invalid_argument("member id must be non-zero"))
            }
            ConfChangeKind::RemoveMember(id) if !self.contains(*id) => {
                Err(TesseraError::MemberNotFound { member_id: *id })
            }
            ConfChangeKind::RemoveMember(_) if self.members.len() == 1 => Err(
                TesseraError::failed_precondition("cannot remove the last member"),
            ),
            ConfChangeKind::UpdateMember(m) if !self.contains(m.id) => {
                Err(TesseraError::MemberNotFound { member_id: m.id })
            }
            _ => Ok(()),
        }
    }

    /// Apply a committed change. Invalid changes were rejected at proposal
    /// time; a replayed change that no longer applies is ignored.
    pub fn apply(&mut self, change: &ConfChangeKind) {
        match change {
            ConfChangeKind::AddMember(m) | ConfChangeKind::UpdateMember(m) => {
                self.members.insert(m.id, m.clone());
            }
            ConfChangeKind::RemoveMember(id) => {
                if self.members.len() > 1 {
                    self.members.remove(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Membership {
        Membership::new((1..=3).map(|i| MemberInfo::new(i, format!("m{}", i), "")))
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(Membership::new(vec![MemberInfo::new(1, "a", "")]).quorum(), 1);
        assert_eq!(three().quorum(), 2);
        let mut m = three();
        m.apply(&ConfChangeKind::AddMember(MemberInfo::new(4, "d", "")));
        assert_eq!(m.quorum(), 3);
    }

    #[test]
    fn validation_catches_duplicates_and_unknowns() {
        let m = three();
        assert!(m
            .validate(&ConfChangeKind::AddMember(MemberInfo::new(2, "dup", "")))
            .is_err());
        assert!(m.validate(&ConfChangeKind::RemoveMember(9)).is_err());
        assert!(m.validate(&ConfChangeKind::RemoveMember(3)).is_ok());
    }
}
