//! Meshmap - Cluster-Replicated Key/Value Map
//!
//! A map-like structure replicated across the members of a group channel.
//! Every entry has exactly one primary node; the primary picks a backup set
//! through a pluggable selection policy and announces the placement to the
//! rest of the cluster as lightweight proxy locators. Any member can read
//! any key: `get` on a non-primary node promotes the entry locally, pulling
//! the value from a backup when only a proxy is present.
//!
//! # Architecture
//!
//! - **`entry`**: the per-key record with its role (primary, backup, proxy,
//!   copy) and placement metadata.
//! - **`message`**: the wire envelope; thirteen message types with stable
//!   integer encodings, raw key/value payloads decoded lazily.
//! - **`membership`**: the registry of peers on the same map context, with
//!   last-heard timestamps and the round-robin backup cursor.
//! - **`policy`**: the backup-selection seam; round-robin single backup is
//!   the shipped strategy.
//! - **`transport`**: the consumed group-channel interfaces plus an
//!   in-process loopback implementation.
//! - **`map`**: the replicated map itself - local operations, the inbound
//!   message dispatcher, and the lifecycle coordinator (init, state
//!   transfer, heartbeat, breakdown).
//!
//! # Features
//!
//! - Per-entry primary/backup/proxy/copy roles with exhaustive transitions
//! - Lazy value fetch through proxy entries
//! - Delta replication for values that can diff themselves
//! - Heartbeat-driven liveness with member expiry and entry relocation
//! - State transfer that bootstraps a joining node from an existing peer
//! - Multiple independent maps multiplexed over one channel by context id

pub mod config;
pub mod entry;
pub mod error;
pub mod map;
pub mod member;
pub mod membership;
pub mod message;
pub mod policy;
pub mod replicable;
pub mod transport;

pub use config::MapConfig;
pub use error::{Error, Result};
pub use map::{MapState, ReplicatedMap};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MapConfig;
    pub use crate::entry::{EntryRole, EntryView};
    pub use crate::error::{Error, Result};
    pub use crate::map::{MapKey, MapState, ReplicatedMap};
    pub use crate::member::MemberId;
    pub use crate::message::{MapMessage, MessageType};
    pub use crate::policy::{BackupPolicy, RoundRobinBackup};
    pub use crate::replicable::{MapOwner, ReplicatedValue};
    pub use crate::transport::{
        GroupChannel, LocalChannel, LocalHub, MapListener, RpcMode, RpcReply, SendOptions,
    };
}
