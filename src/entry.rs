//! Map Entry
//!
//! The per-key record: value, role, and the primary/backup metadata that
//! locates the entry in the cluster.

use crate::error::Result;
use crate::member::MemberId;
use crate::message;
use crate::replicable::ReplicatedValue;

/// Role of an entry on the local node.
///
/// Exactly one role holds at any time. `Primary` owns writes and diff
/// generation; `Backup` stores the full value for a remote primary; `Proxy`
/// is a locator with no value; `Copy` is a read-only full value received
/// during state transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    Primary,
    Backup,
    Proxy,
    Copy,
}

/// A single replicated map entry
#[derive(Debug, Clone)]
pub struct MapEntry<K, V> {
    key: K,
    value: Option<V>,
    role: EntryRole,
    primary: Option<MemberId>,
    backups: Vec<MemberId>,
}

impl<K, V> MapEntry<K, V> {
    /// Create a new entry; freshly created entries are primary
    pub fn new(key: K, value: Option<V>) -> Self {
        Self {
            key,
            value,
            role: EntryRole::Primary,
            primary: None,
            backups: Vec::new(),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut V> {
        self.value.as_mut()
    }

    /// Replace the value, returning the old one
    pub fn set_value(&mut self, value: Option<V>) -> Option<V> {
        std::mem::replace(&mut self.value, value)
    }

    /// Consume the entry, yielding its value
    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn role(&self) -> EntryRole {
        self.role
    }

    pub fn set_role(&mut self, role: EntryRole) {
        self.role = role;
    }

    pub fn is_primary(&self) -> bool {
        self.role == EntryRole::Primary
    }

    pub fn is_backup(&self) -> bool {
        self.role == EntryRole::Backup
    }

    pub fn is_proxy(&self) -> bool {
        self.role == EntryRole::Proxy
    }

    pub fn is_copy(&self) -> bool {
        self.role == EntryRole::Copy
    }

    /// Active entries answer local queries; proxies do not
    pub fn is_active(&self) -> bool {
        self.role != EntryRole::Proxy
    }

    /// The member currently owning writes for this key, if known
    pub fn primary(&self) -> Option<&MemberId> {
        self.primary.as_ref()
    }

    pub fn set_primary(&mut self, primary: Option<MemberId>) {
        self.primary = primary;
    }

    /// The members backing this entry, in selection order
    pub fn backups(&self) -> &[MemberId] {
        &self.backups
    }

    pub fn set_backups(&mut self, backups: Vec<MemberId>) {
        self.backups = backups;
    }

    /// Make the local member the primary for this entry
    pub fn promote(&mut self, local: MemberId, backups: Vec<MemberId>) {
        self.role = EntryRole::Primary;
        self.primary = Some(local);
        self.backups = backups;
    }
}

impl<K, V: ReplicatedValue> MapEntry<K, V> {
    /// Whether the value supports delta replication
    pub fn is_diffable(&self) -> bool {
        self.value.as_ref().map(|v| v.is_diffable()).unwrap_or(false)
    }

    /// Apply a payload received from a peer: a diff if the value supports
    /// it and the sender flagged one, a whole value otherwise. An empty
    /// payload demotes the entry to a proxy (lazy, value dropped).
    ///
    /// The caller must hold the entry's exclusive section; that is what
    /// keeps diff application from interleaving with diff emission.
    pub fn apply_bytes(&mut self, data: &[u8], is_diff: bool) -> Result<()> {
        if is_diff && self.is_diffable() {
            self.value
                .as_mut()
                .expect("diffable entry has a value")
                .apply_diff(data)
        } else if data.is_empty() {
            self.value = None;
            self.role = EntryRole::Proxy;
            Ok(())
        } else {
            self.value = Some(message::decode(data)?);
            Ok(())
        }
    }
}

/// Read-only snapshot of an entry, including inactive roles
#[derive(Debug, Clone)]
pub struct EntryView<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub role: EntryRole,
    pub primary: Option<MemberId>,
    pub backups: Vec<MemberId>,
}

impl<K: Clone, V: Clone> From<&MapEntry<K, V>> for EntryView<K, V> {
    fn from(entry: &MapEntry<K, V>) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            role: entry.role,
            primary: entry.primary.clone(),
            backups: entry.backups.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: u64,
        pending: u64,
    }

    impl ReplicatedValue for Tally {
        fn is_diffable(&self) -> bool {
            true
        }

        fn is_dirty(&self) -> bool {
            self.pending != 0
        }

        fn get_diff(&self) -> Result<Vec<u8>> {
            Ok(self.pending.to_le_bytes().to_vec())
        }

        fn reset_diff(&mut self) {
            self.pending = 0;
        }

        fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
            let bytes: [u8; 8] = diff
                .try_into()
                .map_err(|_| Error::Diff("tally diff must be 8 bytes".into()))?;
            self.total += u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_new_entry_is_primary() {
        let entry: MapEntry<String, String> = MapEntry::new("k".into(), Some("v".into()));
        assert!(entry.is_primary());
        assert!(entry.is_active());
        assert!(entry.backups().is_empty());
    }

    #[test]
    fn test_apply_whole_value() {
        let mut entry: MapEntry<String, String> = MapEntry::new("k".into(), None);
        let data = message::encode(&"fresh".to_string()).unwrap();
        entry.apply_bytes(&data, false).unwrap();
        assert_eq!(entry.value().unwrap(), "fresh");
    }

    #[test]
    fn test_apply_empty_payload_demotes_to_proxy() {
        let mut entry: MapEntry<String, String> = MapEntry::new("k".into(), Some("v".into()));
        entry.apply_bytes(&[], false).unwrap();
        assert!(entry.is_proxy());
        assert!(entry.value().is_none());
        assert!(!entry.is_active());
    }

    #[test]
    fn test_apply_diff_goes_through_the_value() {
        let mut entry: MapEntry<String, Tally> = MapEntry::new(
            "k".into(),
            Some(Tally {
                total: 10,
                pending: 0,
            }),
        );
        entry.apply_bytes(&5u64.to_le_bytes(), true).unwrap();
        assert_eq!(entry.value().unwrap().total, 15);
    }

    #[test]
    fn test_diff_flag_without_diffable_value_replaces_whole() {
        let mut entry: MapEntry<String, String> = MapEntry::new("k".into(), Some("old".into()));
        let data = message::encode(&"new".to_string()).unwrap();
        entry.apply_bytes(&data, true).unwrap();
        assert_eq!(entry.value().unwrap(), "new");
    }

    #[test]
    fn test_promote_clears_role_and_sets_primary() {
        let mut entry: MapEntry<String, String> = MapEntry::new("k".into(), Some("v".into()));
        entry.set_role(EntryRole::Backup);
        entry.set_primary(Some(MemberId::new("remote")));

        entry.promote(MemberId::new("local"), vec![MemberId::new("remote")]);
        assert!(entry.is_primary());
        assert_eq!(entry.primary().unwrap().as_str(), "local");
        assert_eq!(entry.backups(), &[MemberId::new("remote")]);
    }
}
