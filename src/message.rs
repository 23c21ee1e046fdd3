//! Map Wire Protocol
//!
//! Defines the message envelope exchanged between map peers. Keys and
//! values travel as pre-encoded byte slices and are decoded lazily, so the
//! envelope itself never depends on the caller's key/value types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::member::MemberId;

/// Encode a payload for the wire
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a payload from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Protocol message types.
///
/// The discriminants are the wire encoding and must never change: a peer
/// running an older release decodes messages from a newer one for the types
/// it understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
    /// Full value (or diff) for a key the receiver backs up
    Backup = 1,
    /// Request the current value of a key from its backup
    RetrieveBackup = 2,
    /// Locator metadata: the key lives at a primary with these backups
    Proxy = 3,
    /// Delete the key locally
    Remove = 4,
    /// State-transfer request, proxy-only snapshot
    State = 5,
    /// Sender completed state transfer and is ready
    Start = 6,
    /// Sender is leaving the map
    Stop = 7,
    /// Sender announces its existence on the map
    Init = 8,
    /// Read-only full value distributed during state transfer
    Copy = 9,
    /// State-transfer request, full-value snapshot
    StateCopy = 10,
    /// The key was accessed on its primary; refresh metadata
    Access = 11,
    /// Primary/backup metadata changed for a key
    NotifyMapMember = 12,
    /// Liveness probe carrying the sender's lifecycle state
    Ping = 13,
}

impl MessageType {
    /// The message type name (for logging)
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Backup => "BACKUP",
            MessageType::RetrieveBackup => "RETRIEVE_BACKUP",
            MessageType::Proxy => "PROXY",
            MessageType::Remove => "REMOVE",
            MessageType::State => "STATE",
            MessageType::Start => "START",
            MessageType::Stop => "STOP",
            MessageType::Init => "INIT",
            MessageType::Copy => "COPY",
            MessageType::StateCopy => "STATE_COPY",
            MessageType::Access => "ACCESS",
            MessageType::NotifyMapMember => "NOTIFY_MAPMEMBER",
            MessageType::Ping => "PING",
        }
    }
}

impl From<MessageType> for u8 {
    fn from(ty: MessageType) -> u8 {
        ty as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Backup),
            2 => Ok(MessageType::RetrieveBackup),
            3 => Ok(MessageType::Proxy),
            4 => Ok(MessageType::Remove),
            5 => Ok(MessageType::State),
            6 => Ok(MessageType::Start),
            7 => Ok(MessageType::Stop),
            8 => Ok(MessageType::Init),
            9 => Ok(MessageType::Copy),
            10 => Ok(MessageType::StateCopy),
            11 => Ok(MessageType::Access),
            12 => Ok(MessageType::NotifyMapMember),
            13 => Ok(MessageType::Ping),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Envelope for all map-to-map traffic.
///
/// Carries the map context id, the message type, optional raw key/value
/// payloads, optional diff bytes, and the primary/backup metadata of the
/// entry in question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMessage {
    map_id: Vec<u8>,
    msg_type: MessageType,
    diff: bool,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    diff_value: Option<Vec<u8>>,
    primary: Option<MemberId>,
    backups: Vec<MemberId>,
}

impl MapMessage {
    /// Create an empty message of the given type for the given map
    pub fn new(map_id: &[u8], msg_type: MessageType) -> Self {
        Self {
            map_id: map_id.to_vec(),
            msg_type,
            diff: false,
            key: None,
            value: None,
            diff_value: None,
            primary: None,
            backups: Vec::new(),
        }
    }

    /// Attach a pre-encoded key
    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    /// Attach a pre-encoded value
    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach diff bytes and mark the message as a diff
    pub fn with_diff(mut self, diff: Vec<u8>) -> Self {
        self.diff = true;
        self.diff_value = Some(diff);
        self
    }

    /// Attach the primary member
    pub fn with_primary(mut self, primary: MemberId) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Attach the primary member, if known
    pub fn with_primary_opt(mut self, primary: Option<MemberId>) -> Self {
        self.primary = primary;
        self
    }

    /// Attach the backup list
    pub fn with_backups(mut self, backups: Vec<MemberId>) -> Self {
        self.backups = backups;
        self
    }

    /// The map context id this message belongs to
    pub fn map_id(&self) -> &[u8] {
        &self.map_id
    }

    /// The message type
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Whether the value payload is a diff
    pub fn is_diff(&self) -> bool {
        self.diff
    }

    /// Raw encoded key, if present
    pub fn key_raw(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Raw encoded value, if present
    pub fn value_raw(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Diff bytes, if present
    pub fn diff_value(&self) -> Option<&[u8]> {
        self.diff_value.as_deref()
    }

    /// The primary member recorded on the message
    pub fn primary(&self) -> Option<&MemberId> {
        self.primary.as_ref()
    }

    /// The backup list recorded on the message
    pub fn backups(&self) -> &[MemberId] {
        &self.backups
    }

    /// Stamp the primary member (used when replying to INIT/START/PING)
    pub fn set_primary(&mut self, primary: Option<MemberId>) {
        self.primary = primary;
    }

    /// Replace the raw value payload (used when answering RETRIEVE_BACKUP
    /// and state-transfer requests)
    pub fn set_value_raw(&mut self, value: Option<Vec<u8>>) {
        self.value = value;
    }

    /// Decode the key into the caller's key type
    pub fn decode_key<K: DeserializeOwned>(&self) -> Result<Option<K>> {
        match &self.key {
            Some(bytes) if !bytes.is_empty() => Ok(Some(decode(bytes)?)),
            _ => Ok(None),
        }
    }

    /// Decode the value payload into the caller's type
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.value {
            Some(bytes) if !bytes.is_empty() => Ok(Some(decode(bytes)?)),
            _ => Ok(None),
        }
    }

    /// Serialize the envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Deserialize an envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}
