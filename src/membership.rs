//! Map Membership
//!
//! Tracks the peers that announced themselves on the same map context,
//! keyed by the instant we last heard from them, plus the round-robin
//! cursor used for backup selection. One mutex guards both so that
//! membership snapshots and cursor advancement stay consistent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::member::MemberId;

struct Registry {
    members: HashMap<MemberId, Instant>,
    cursor: usize,
}

/// Registry of live map members
pub struct Membership {
    local: MemberId,
    inner: Mutex<Registry>,
}

impl Membership {
    /// Create a registry for the given local member
    pub fn new(local: MemberId) -> Self {
        Self {
            local,
            inner: Mutex::new(Registry {
                members: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// The local member's id
    pub fn local(&self) -> &MemberId {
        &self.local
    }

    /// Add a member with the current timestamp if it is not already known.
    /// Returns true if the member was newly added. The local member is
    /// never added.
    pub fn add_if_absent(&self, member: &MemberId) -> bool {
        if *member == self.local {
            return false;
        }
        let mut inner = self.lock();
        if inner.members.contains_key(member) {
            false
        } else {
            inner.members.insert(member.clone(), Instant::now());
            true
        }
    }

    /// Refresh the member's last-heard timestamp, adding it if unknown
    pub fn stamp(&self, member: &MemberId) {
        if *member == self.local {
            return;
        }
        let mut inner = self.lock();
        inner.members.insert(member.clone(), Instant::now());
    }

    /// Refresh the timestamp only for an already-known member.
    /// Returns true if the member was present.
    pub fn touch_if_present(&self, member: &MemberId) -> bool {
        let mut inner = self.lock();
        match inner.members.get_mut(member) {
            Some(at) => {
                *at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a member; returns true if it was present
    pub fn remove(&self, member: &MemberId) -> bool {
        self.lock().members.remove(member).is_some()
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.lock().members.contains_key(member)
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.members.clear();
        inner.cursor = 0;
    }

    /// Snapshot of the known members, sorted by id so every node walks the
    /// membership in the same order
    pub fn members(&self) -> Vec<MemberId> {
        let inner = self.lock();
        Self::sorted(&inner)
    }

    /// Snapshot of the members minus the given set
    pub fn members_excluding(&self, exclude: &[MemberId]) -> Vec<MemberId> {
        self.members()
            .into_iter()
            .filter(|m| !exclude.contains(m))
            .collect()
    }

    /// Members whose last-heard age exceeds the timeout
    pub fn expired(&self, timeout: Duration) -> Vec<MemberId> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .members
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > timeout)
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Pick the next backup node, advancing the round-robin cursor.
    ///
    /// The cursor protocol: read the size, take `node = cursor` and bump the
    /// cursor; when `node` runs past the end, wrap to 0 and reset the cursor
    /// to 1. Several nodes walking the same sorted membership therefore pick
    /// similar backups.
    pub fn next_backup(&self) -> Option<MemberId> {
        let mut inner = self.lock();
        let size = inner.members.len();
        if size == 0 {
            return None;
        }
        let mut node = inner.cursor;
        inner.cursor += 1;
        if node >= size {
            node = 0;
            inner.cursor = 1;
        }
        Some(Self::sorted(&inner)[node].clone())
    }

    fn sorted(inner: &Registry) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = inner.members.keys().cloned().collect();
        members.sort();
        members
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // a panic while holding this mutex is unrecoverable for the map
        self.inner.lock().expect("membership mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Membership {
        Membership::new(MemberId::new("local"))
    }

    #[test]
    fn test_add_and_remove() {
        let members = registry();
        assert!(members.add_if_absent(&MemberId::new("a")));
        assert!(!members.add_if_absent(&MemberId::new("a")));
        assert!(members.contains(&MemberId::new("a")));
        assert_eq!(members.len(), 1);

        assert!(members.remove(&MemberId::new("a")));
        assert!(!members.remove(&MemberId::new("a")));
        assert!(members.is_empty());
    }

    #[test]
    fn test_local_member_is_never_added() {
        let members = registry();
        assert!(!members.add_if_absent(&MemberId::new("local")));
        members.stamp(&MemberId::new("local"));
        assert!(members.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let members = registry();
        members.add_if_absent(&MemberId::new("c"));
        members.add_if_absent(&MemberId::new("a"));
        members.add_if_absent(&MemberId::new("b"));
        assert_eq!(
            members.members(),
            vec![MemberId::new("a"), MemberId::new("b"), MemberId::new("c")]
        );
        assert_eq!(
            members.members_excluding(&[MemberId::new("b")]),
            vec![MemberId::new("a"), MemberId::new("c")]
        );
    }

    #[test]
    fn test_expiry() {
        let members = registry();
        members.add_if_absent(&MemberId::new("a"));
        assert!(members.expired(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(30));
        let expired = members.expired(Duration::from_millis(10));
        assert_eq!(expired, vec![MemberId::new("a")]);

        members.touch_if_present(&MemberId::new("a"));
        assert!(members.expired(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_round_robin_cursor_cycles() {
        let members = registry();
        members.add_if_absent(&MemberId::new("a"));
        members.add_if_absent(&MemberId::new("b"));
        members.add_if_absent(&MemberId::new("c"));

        let picks: Vec<String> = (0..6)
            .map(|_| members.next_backup().unwrap().as_str().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_cursor_wraps_after_shrink() {
        let members = registry();
        members.add_if_absent(&MemberId::new("a"));
        members.add_if_absent(&MemberId::new("b"));
        members.add_if_absent(&MemberId::new("c"));
        members.next_backup();
        members.next_backup();

        // cursor now points past the end of the shrunk membership
        members.remove(&MemberId::new("c"));
        assert_eq!(members.next_backup().unwrap(), MemberId::new("a"));
        assert_eq!(members.next_backup().unwrap(), MemberId::new("b"));
    }

    #[test]
    fn test_next_backup_on_empty_registry() {
        let members = registry();
        assert!(members.next_backup().is_none());
    }
}
