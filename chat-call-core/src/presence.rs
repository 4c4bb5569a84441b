//! Presence roster and per-pair initiator election.
//!
//! Every participant announces itself on the call topic when joining. On
//! each snapshot, every pair of participants elects exactly one offerer
//! with a deterministic, order-independent tie-break: the lexicographically
//! smaller user id initiates. No coordinator is needed and N-way calls
//! scale because every pair elects independently.

use crate::types::{PresenceEntry, UserId};

/// Whether `local` creates the offer toward `remote`.
///
/// Deterministic and antisymmetric: for any two distinct ids exactly one
/// side initiates, regardless of which side evaluates first.
#[must_use]
pub fn initiates(local: &UserId, remote: &UserId) -> bool {
    local < remote
}

/// Current view of who is joined to a call topic.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    entries: Vec<PresenceEntry>,
}

/// Difference between two consecutive presence snapshots.
#[derive(Debug, Default, PartialEq)]
pub struct PresenceDiff {
    /// Participants present now but not before.
    pub joined: Vec<UserId>,
    /// Participants present before but gone now.
    pub left: Vec<UserId>,
}

impl PresenceRoster {
    /// Empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a new snapshot, returning who joined and
    /// who left relative to the previous one.
    pub fn update(&mut self, snapshot: Vec<PresenceEntry>) -> PresenceDiff {
        let joined = snapshot
            .iter()
            .filter(|e| !self.contains(&e.user_id))
            .map(|e| e.user_id.clone())
            .collect();
        let left = self
            .entries
            .iter()
            .filter(|e| !snapshot.iter().any(|n| n.user_id == e.user_id))
            .map(|e| e.user_id.clone())
            .collect();
        self.entries = snapshot;
        PresenceDiff { joined, left }
    }

    /// Whether a participant is currently announced.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.entries.iter().any(|e| e.user_id == *user)
    }

    /// Everyone currently announced except `local`.
    #[must_use]
    pub fn remotes(&self, local: &UserId) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|e| e.user_id != *local)
            .map(|e| e.user_id.clone())
            .collect()
    }

    /// Number of announced participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is announced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> UserId {
        UserId::new(s)
    }

    #[test]
    fn election_is_antisymmetric() {
        let a = user("alice");
        let b = user("bob");
        assert!(initiates(&a, &b));
        assert!(!initiates(&b, &a));
        // Exactly one initiator per pair, regardless of evaluation order.
        assert_ne!(initiates(&a, &b), initiates(&b, &a));
    }

    #[test]
    fn election_agrees_for_arbitrary_pairs() {
        let ids = ["a", "zz", "m-7", "m-70", "0user", "Alice"];
        for x in &ids {
            for y in &ids {
                if x == y {
                    continue;
                }
                let (x, y) = (user(x), user(y));
                assert_ne!(initiates(&x, &y), initiates(&y, &x), "{x} vs {y}");
            }
        }
    }

    #[test]
    fn roster_diffs_joins_and_leaves() {
        let mut roster = PresenceRoster::new();

        let diff = roster.update(vec![
            PresenceEntry::now(user("alice")),
            PresenceEntry::now(user("bob")),
        ]);
        assert_eq!(diff.joined, vec![user("alice"), user("bob")]);
        assert!(diff.left.is_empty());

        let diff = roster.update(vec![
            PresenceEntry::now(user("bob")),
            PresenceEntry::now(user("carol")),
        ]);
        assert_eq!(diff.joined, vec![user("carol")]);
        assert_eq!(diff.left, vec![user("alice")]);

        assert_eq!(roster.remotes(&user("bob")), vec![user("carol")]);
        assert_eq!(roster.len(), 2);
    }
}
