//! Value Contracts
//!
//! Every value stored in a replicated map implements [`ReplicatedValue`].
//! All replication hooks have default bodies, so a plain data type opts in
//! with an empty impl and is then replicated only by full value. Types that
//! can express their changes incrementally override the diff hooks and get
//! delta replication instead of full snapshots.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Capability contract for replicated values.
///
/// A value advertising `is_diffable()` must implement `get_diff`,
/// `reset_diff`, and `apply_diff`; the map guarantees that `apply_diff` on a
/// replica never interleaves with `get_diff`/`reset_diff` on the primary for
/// the same entry.
pub trait ReplicatedValue:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether this value can emit and apply incremental changes
    fn is_diffable(&self) -> bool {
        false
    }

    /// Whether the value changed since the last replication
    fn is_dirty(&self) -> bool {
        false
    }

    /// Whether a bare access should be replicated as metadata
    fn is_access_replicate(&self) -> bool {
        false
    }

    /// Serialize the changes since the last `reset_diff`
    fn get_diff(&self) -> Result<Vec<u8>> {
        Err(Error::NotDiffable)
    }

    /// Forget the accumulated changes after they were shipped
    fn reset_diff(&mut self) {}

    /// Apply a diff produced by `get_diff` on the primary
    fn apply_diff(&mut self, _diff: &[u8]) -> Result<()> {
        Err(Error::NotDiffable)
    }

    /// The entry was accessed on its primary
    fn access_entry(&mut self) {}

    /// Record when the value was last shipped to its backups
    fn set_last_replicated(&mut self, _at_ms: u64) {}

    /// Ownership of the entry moved to the local map; the value can re-bind
    /// whatever context it captured at construction
    fn owner_changed(&mut self) {}
}

impl ReplicatedValue for String {}
impl ReplicatedValue for Vec<u8> {}
impl ReplicatedValue for u64 {}
impl ReplicatedValue for i64 {}

/// Callback interface for the application embedding a map.
///
/// `object_made_primary` fires whenever an entry transitions to primary
/// through failover or an explicit `get` promotion; it does not fire on the
/// initial local `put`, which is primary from birth.
pub trait MapOwner<K, V>: Send + Sync {
    /// The local node became primary for the given entry
    fn object_made_primary(&self, key: &K, value: Option<&V>);
}
