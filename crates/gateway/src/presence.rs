// Presence Tracking
//
// This module derives global online/offline status from per-user connection
// counts. Only the 0->1 and 1->0 edges are reported, so a user with several
// tabs open produces one "online" and one "offline" no matter how many
// connections come and go in between.

use parley_core::UserId;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// Live connection count per online user (never holds a zero)
    counts: HashMap<UserId, usize>,

    /// Bumped on every online/offline transition
    state_version: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more connection; true if the user just came online
    pub fn add_connection(&mut self, user_id: &str) -> bool {
        let count = self.counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.state_version += 1;
            true
        } else {
            false
        }
    }

    /// Count one fewer connection; true if the user just went offline.
    /// Removing from a user with no connections does nothing.
    pub fn remove_connection(&mut self, user_id: &str) -> bool {
        let Some(count) = self.counts.get_mut(user_id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(user_id);
            self.state_version += 1;
            true
        } else {
            false
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.counts.contains_key(user_id)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.counts.get(user_id).copied().unwrap_or(0)
    }

    /// Current online set, sorted
    pub fn snapshot_online_users(&self) -> BTreeSet<UserId> {
        self.counts.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.counts.len()
    }

    pub fn state_version(&self) -> u64 {
        self.state_version
    }
}
