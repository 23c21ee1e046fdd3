//! Member Identity
//!
//! Identifies a peer on the group channel and in the map membership.

use serde::{Deserialize, Serialize};

/// Unique identifier of a cluster member.
///
/// The transport assigns ids; the map only compares, orders, and ships them
/// on the wire. Ordering is total so that member snapshots can be sorted
/// and several nodes starting from the same state agree on backup choices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a new member id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
