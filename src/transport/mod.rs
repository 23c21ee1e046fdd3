//! Transport Interfaces
//!
//! The group-communication layer the map is built on. The map consumes a
//! [`GroupChannel`] (one-way sends plus an RPC layer with first-reply and
//! all-reply collection) and registers itself as a [`MapListener`] so the
//! transport can hand it inbound messages, reply requests, and membership
//! events. The wire transport itself lives outside this crate; the
//! in-process loopback in [`local`] is the reference implementation.

pub mod local;

pub use local::{LocalChannel, LocalHub};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::member::MemberId;
use crate::message::MapMessage;

/// Send options forwarded opaquely to the transport.
///
/// The map never interprets the bits; they ride along so embedders can pick
/// acknowledged or asynchronous delivery per map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions(u32);

impl SendOptions {
    /// Deliver with a receipt acknowledgment
    pub const USE_ACK: SendOptions = SendOptions(0x0002);
    /// Acknowledge only after the receiver processed the message
    pub const SYNCHRONIZED_ACK: SendOptions = SendOptions(0x0004);
    /// Queue the message and return without waiting
    pub const ASYNCHRONOUS: SendOptions = SendOptions(0x0008);

    /// The raw option bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub fn contains(self, other: SendOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::USE_ACK
    }
}

impl std::ops::BitOr for SendOptions {
    type Output = SendOptions;

    fn bitor(self, rhs: SendOptions) -> SendOptions {
        SendOptions(self.0 | rhs.0)
    }
}

/// How many replies an RPC call waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMode {
    /// Return as soon as one destination replied
    FirstReply,
    /// Collect replies from every destination
    AllReply,
}

/// A single RPC reply paired with the member that produced it
#[derive(Debug, Clone)]
pub struct RpcReply {
    /// The replying member
    pub source: MemberId,
    /// The reply message
    pub message: MapMessage,
}

/// Group communication channel consumed by the map.
///
/// Implementations must preserve per-sender FIFO ordering towards a single
/// destination; no ordering is required across senders or destinations. A
/// failed group send should report the unreachable destinations through
/// [`crate::Error::FaultyMembers`].
#[async_trait]
pub trait GroupChannel: Send + Sync {
    /// The local member's id
    fn local_member(&self) -> MemberId;

    /// Currently live channel members, excluding the local member
    fn members(&self) -> Vec<MemberId>;

    /// One-way send to the given destinations
    async fn send(&self, to: &[MemberId], message: MapMessage, options: SendOptions) -> Result<()>;

    /// RPC send: deliver to the destinations and collect replies per `mode`.
    ///
    /// Replies that arrive after the collect window closes are handed to the
    /// caller's listeners through [`MapListener::left_over`].
    async fn send_rpc(
        &self,
        to: &[MemberId],
        message: MapMessage,
        mode: RpcMode,
        options: SendOptions,
        timeout: Duration,
    ) -> Result<Vec<RpcReply>>;

    /// Register a listener for inbound traffic on this channel
    fn attach(&self, listener: Arc<dyn MapListener>);

    /// Deregister the listener with the given map id
    fn detach(&self, map_id: &[u8]);
}

/// Inbound interface the transport drives.
///
/// A replicated map implements this; several maps can share one channel and
/// each filters by map id in [`accept`](MapListener::accept).
#[async_trait]
pub trait MapListener: Send + Sync {
    /// The map context id this listener answers for
    fn map_id(&self) -> &[u8];

    /// Whether this listener wants the message (map id byte-equality)
    fn accept(&self, message: &MapMessage) -> bool;

    /// An asynchronous (non-RPC) message arrived
    async fn message_received(&self, message: MapMessage, sender: MemberId);

    /// An RPC request arrived; return the reply, or `None` to stay silent
    async fn reply_request(&self, message: MapMessage, sender: MemberId) -> Option<MapMessage>;

    /// An RPC reply arrived after its collect window closed
    async fn left_over(&self, message: MapMessage, sender: MemberId);

    /// The transport noticed a member leaving or failing
    async fn member_disappeared(&self, member: MemberId);
}
