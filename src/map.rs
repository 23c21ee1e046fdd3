//! Replicated Map
//!
//! The core of the crate: a map-like structure whose entries are replicated
//! across the members of a group channel. Each entry lives on exactly one
//! primary node, is mirrored to a backup set chosen by the configured
//! [`BackupPolicy`], and appears everywhere else as a lightweight proxy
//! locator. `get` on a non-primary node promotes the entry locally, pulling
//! the value from a backup when only a proxy is present; heartbeats expire
//! silent members and relocate their entries.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;

use crate::config::MapConfig;
use crate::entry::{EntryRole, EntryView, MapEntry};
use crate::error::{Error, Result};
use crate::member::MemberId;
use crate::membership::Membership;
use crate::message::{self, MapMessage, MessageType};
use crate::policy::{BackupPolicy, PublishContext, RoundRobinBackup};
use crate::replicable::{MapOwner, ReplicatedValue};
use crate::transport::{GroupChannel, MapListener, RpcMode, SendOptions};

/// Bounds a key type must satisfy to live in a replicated map
pub trait MapKey:
    Clone + Eq + std::hash::Hash + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> MapKey for T where
    T: Clone
        + Eq
        + std::hash::Hash
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Lifecycle state of a map.
///
/// Transitions are monotonic: `New → StateTransferred → Initialized →
/// Destroyed`. Only `Initialized` answers heartbeats as available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapState {
    New,
    StateTransferred,
    Initialized,
    Destroyed,
}

impl MapState {
    /// Whether the map is fully up and serving
    pub fn is_available(self) -> bool {
        self == MapState::Initialized
    }

    fn from_u8(value: u8) -> MapState {
        match value {
            0 => MapState::New,
            1 => MapState::StateTransferred,
            2 => MapState::Initialized,
            _ => MapState::Destroyed,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: MapState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> MapState {
        MapState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: MapState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn swap(&self, state: MapState) -> MapState {
        MapState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

/// A cluster-replicated key/value map.
///
/// Local callers use the map API (`get`/`put`/`remove`/`replicate`); the
/// transport drives the [`MapListener`] side with inbound messages and
/// membership events. Several maps can share one channel; each only accepts
/// messages carrying its own context id.
pub struct ReplicatedMap<K, V>
where
    K: MapKey,
    V: ReplicatedValue,
{
    name: String,
    map_id: Vec<u8>,
    channel: Arc<dyn GroupChannel>,
    policy: Arc<dyn BackupPolicy>,
    membership: Membership,
    entries: DashMap<K, MapEntry<K, V>>,
    owner: RwLock<Option<Arc<dyn MapOwner<K, V>>>>,
    state: StateCell,
    /// Serializes state-transfer snapshots against the catch-up rescan that
    /// runs when a member joins
    state_mutex: TokioMutex<()>,
    state_transferred: AtomicBool,
    rpc_timeout: Duration,
    access_timeout: Duration,
    heartbeat_interval: Duration,
    send_options: SendOptions,
    transfer_full_state: bool,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: MapKey,
    V: ReplicatedValue,
{
    /// Create a map with the default round-robin backup policy.
    ///
    /// The map is inert until [`init`](Self::init) runs.
    pub fn new(config: MapConfig, channel: Arc<dyn GroupChannel>) -> Result<Arc<Self>> {
        Self::with_policy(config, channel, Arc::new(RoundRobinBackup))
    }

    /// Create a map with a custom backup policy
    pub fn with_policy(
        config: MapConfig,
        channel: Arc<dyn GroupChannel>,
        policy: Arc<dyn BackupPolicy>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local = channel.local_member();
        Ok(Arc::new(Self {
            name: config.map_name.clone(),
            map_id: config.map_id(),
            rpc_timeout: config.rpc_timeout(),
            access_timeout: config.access_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            send_options: config.send_options,
            transfer_full_state: config.transfer_full_state,
            channel,
            policy,
            membership: Membership::new(local),
            entries: DashMap::new(),
            owner: RwLock::new(None),
            state: StateCell::new(MapState::New),
            state_mutex: TokioMutex::new(()),
            state_transferred: AtomicBool::new(false),
        }))
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Join the cluster: register on the channel, announce our existence,
    /// pull state from an existing peer, and announce readiness.
    ///
    /// With `terminate` set, a failure tears the map down and surfaces the
    /// error; otherwise the failure is logged and the map stays
    /// unavailable.
    pub async fn init(self: Arc<Self>, terminate: bool) -> Result<()> {
        let started = Instant::now();
        tracing::info!(map = %self.name, "initializing replicated map");
        self.channel.attach(self.clone());

        let result = async {
            self.broadcast(MessageType::Init, true).await?;
            self.transfer_state().await;
            self.broadcast(MessageType::Start, true).await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(map = %self.name, error = %err, "unable to send start message");
            if terminate {
                self.breakdown().await;
                return Err(Error::StartupFailed(self.name.clone()));
            }
            return Ok(());
        }

        self.state.store(MapState::Initialized);
        tracing::info!(
            map = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "replicated map initialized"
        );
        Ok(())
    }

    /// Leave the cluster and drop all local state. Idempotent.
    pub async fn breakdown(&self) {
        if self.state.swap(MapState::Destroyed) == MapState::Destroyed {
            return;
        }
        tracing::info!(map = %self.name, "shutting down replicated map");
        if let Err(err) = self.broadcast(MessageType::Stop, false).await {
            tracing::debug!(map = %self.name, error = %err, "stop broadcast failed");
        }
        self.channel.detach(&self.map_id);
        self.membership.clear();
        self.entries.clear();
        self.state_transferred.store(false, Ordering::SeqCst);
    }

    /// Periodic liveness pass: ping the cluster and expire silent members.
    /// A no-op until the map is available. Errors are logged, never raised.
    pub async fn heartbeat(&self) {
        if self.state().is_available() {
            if let Err(err) = self.ping(self.access_timeout).await {
                tracing::error!(map = %self.name, error = %err, "map heartbeat failed");
            }
        }
    }

    /// Run [`heartbeat`](Self::heartbeat) on the configured interval until
    /// the map is destroyed
    pub fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let map = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(map.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if map.state() == MapState::Destroyed {
                    break;
                }
                map.heartbeat().await;
            }
        })
    }

    /// Ping every channel member and expire map members that have been
    /// silent for longer than `timeout`
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let members = self.channel.members();
        if !members.is_empty() {
            let msg = MapMessage::new(&self.map_id, MessageType::Ping).with_primary(self.local());
            match self
                .channel
                .send_rpc(
                    &members,
                    msg,
                    RpcMode::AllReply,
                    self.send_options,
                    self.access_timeout,
                )
                .await
            {
                Ok(replies) => {
                    for reply in replies {
                        match reply.message.decode_value::<MapState>() {
                            Ok(Some(state)) if state.is_available() => {
                                self.member_alive(&reply.source).await;
                            }
                            Ok(Some(MapState::StateTransferred)) => {
                                if self.membership.touch_if_present(&reply.source) {
                                    tracing::info!(
                                        map = %self.name,
                                        member = %reply.source,
                                        "member is still transferring state"
                                    );
                                }
                            }
                            Ok(Some(state)) => tracing::info!(
                                map = %self.name,
                                member = %reply.source,
                                state = ?state,
                                "map member is unavailable"
                            ),
                            Ok(None) => {}
                            Err(err) => tracing::error!(
                                map = %self.name,
                                error = %err,
                                "unable to deserialize ping reply"
                            ),
                        }
                    }
                }
                Err(err) => {
                    for member in err.faulty_members().to_vec() {
                        self.member_disappeared_inner(&member).await;
                    }
                    return Err(err);
                }
            }
        }
        for member in self.membership.expired(timeout) {
            tracing::warn!(
                map = %self.name,
                member = %member,
                "member failed to answer the ping, dropping it"
            );
            self.member_disappeared_inner(&member).await;
        }
        Ok(())
    }

    /// Broadcast a bare lifecycle message to all channel members. With
    /// `rpc`, waits for the first reply and feeds every reply through
    /// membership and the dispatcher.
    async fn broadcast(&self, msg_type: MessageType, rpc: bool) -> Result<()> {
        let members = self.channel.members();
        if members.is_empty() {
            return Ok(());
        }
        let msg = MapMessage::new(&self.map_id, msg_type).with_primary(self.local());
        if rpc {
            let replies = self
                .channel
                .send_rpc(
                    &members,
                    msg,
                    RpcMode::FirstReply,
                    self.send_options,
                    self.rpc_timeout,
                )
                .await?;
            if replies.is_empty() {
                tracing::warn!(
                    map = %self.name,
                    ty = msg_type.name(),
                    "broadcast received no replies"
                );
            }
            for reply in replies {
                self.map_member_added(&reply.source).await;
                self.handle_message(reply.message, reply.source).await;
            }
            Ok(())
        } else {
            self.channel.send(&members, msg, self.send_options).await
        }
    }

    /// Pull the entry snapshot from the first known map member and apply it
    /// through the normal dispatcher
    async fn transfer_state(&self) {
        let members = self.membership.members();
        if let Some(source) = members.first() {
            let ty = if self.transfer_full_state {
                MessageType::StateCopy
            } else {
                MessageType::State
            };
            let msg = MapMessage::new(&self.map_id, ty);
            match self
                .channel
                .send_rpc(
                    std::slice::from_ref(source),
                    msg,
                    RpcMode::FirstReply,
                    self.send_options,
                    self.rpc_timeout,
                )
                .await
            {
                Ok(replies) => match replies.into_iter().next() {
                    Some(reply) => {
                        let _guard = self.state_mutex.lock().await;
                        match reply.message.decode_value::<Vec<MapMessage>>() {
                            Ok(Some(snapshot)) => {
                                for m in snapshot {
                                    self.handle_message(m, reply.source.clone()).await;
                                }
                                self.state_transferred.store(true, Ordering::SeqCst);
                            }
                            Ok(None) => {
                                tracing::warn!(map = %self.name, "state transfer reply carried no data");
                            }
                            Err(err) => tracing::error!(
                                map = %self.name,
                                error = %err,
                                "unable to deserialize state transfer reply"
                            ),
                        }
                    }
                    None => tracing::warn!(map = %self.name, "no replies to state transfer request"),
                },
                Err(err) => {
                    tracing::error!(map = %self.name, error = %err, "unable to transfer map state");
                }
            }
        }
        self.state.store(MapState::StateTransferred);
    }

    // ------------------------------------------------------------------
    // membership reconciliation
    // ------------------------------------------------------------------

    /// A peer announced itself on this map. Newly added members trigger a
    /// catch-up pass that assigns them backup duty for any primary entry
    /// that never got a backup.
    pub async fn map_member_added(&self, member: &MemberId) {
        if member == self.membership.local() {
            return;
        }
        if !self.membership.add_if_absent(member) {
            return;
        }
        tracing::info!(map = %self.name, member = %member, "map member added");

        let _guard = self.state_mutex.lock().await;
        for key in self.key_snapshot() {
            let needs_backup = self
                .entries
                .get(&key)
                .map(|e| e.is_primary() && e.backups().is_empty())
                .unwrap_or(false);
            if !needs_backup {
                continue;
            }
            match self.encoded_pair(&key) {
                Ok((key_raw, value_raw)) => {
                    match self.publish_entry_info(&key_raw, value_raw.as_deref()).await {
                        Ok(backups) => {
                            if let Some(mut e) = self.entries.get_mut(&key) {
                                e.set_backups(backups);
                                e.set_primary(Some(self.local()));
                            }
                        }
                        Err(err) => tracing::error!(
                            map = %self.name,
                            key = ?key,
                            error = %err,
                            "unable to select backup node"
                        ),
                    }
                }
                Err(err) => tracing::error!(
                    map = %self.name,
                    key = ?key,
                    error = %err,
                    "unable to serialize entry for replication"
                ),
            }
        }
    }

    async fn member_alive(&self, member: &MemberId) {
        self.map_member_added(member).await;
        self.membership.stamp(member);
    }

    /// A member left or died: drop it from the registry and walk every
    /// entry, replacing lost backups, clearing lost primaries, deleting
    /// orphaned proxies, and promoting ourselves where we hold the only
    /// surviving backup.
    async fn member_disappeared_inner(&self, member: &MemberId) {
        if !self.membership.remove(member) {
            tracing::debug!(
                map = %self.name,
                member = %member,
                "disappeared member was not a map member"
            );
            return;
        }
        tracing::info!(map = %self.name, member = %member, "member disappeared, relocating its entries");
        let started = Instant::now();

        for key in self.key_snapshot() {
            let mut republish = false;
            let mut remove_orphan = false;
            let mut promoted_value: Option<Option<V>> = None;
            {
                let Some(mut guard) = self.entries.get_mut(&key) else {
                    continue;
                };
                let e = guard.value_mut();
                if e.is_primary() && e.backups().contains(member) {
                    republish = true;
                } else if e.primary() == Some(member) {
                    e.set_primary(None);
                }
                if !republish {
                    let lone_backup = e.backups().len() == 1;
                    if e.is_proxy()
                        && e.primary().is_none()
                        && lone_backup
                        && e.backups()[0] == *member
                    {
                        remove_orphan = true;
                    } else if e.primary().is_none()
                        && e.is_backup()
                        && lone_backup
                        && e.backups()[0] == *self.membership.local()
                    {
                        tracing::debug!(map = %self.name, key = ?key, "taking over primary duty");
                        let current = e.backups().to_vec();
                        e.promote(self.local(), current);
                        promoted_value = Some(e.value().cloned());
                    }
                }
            }

            if remove_orphan {
                tracing::debug!(map = %self.name, key = ?key, "removing orphaned proxy entry");
                self.entries.remove(&key);
                continue;
            }
            if republish || promoted_value.is_some() {
                match self.encoded_pair(&key) {
                    Ok((key_raw, value_raw)) => {
                        match self.publish_entry_info(&key_raw, value_raw.as_deref()).await {
                            Ok(backups) => {
                                if let Some(mut guard) = self.entries.get_mut(&key) {
                                    let e = guard.value_mut();
                                    e.set_backups(backups);
                                    e.set_primary(Some(self.local()));
                                    if promoted_value.is_some() {
                                        if let Some(v) = e.value_mut() {
                                            v.owner_changed();
                                        }
                                    }
                                }
                                if let Some(value) = promoted_value {
                                    self.notify_owner_made_primary(&key, value.as_ref());
                                }
                            }
                            Err(err) => tracing::error!(
                                map = %self.name,
                                key = ?key,
                                error = %err,
                                "unable to relocate entry"
                            ),
                        }
                    }
                    Err(err) => tracing::error!(
                        map = %self.name,
                        key = ?key,
                        error = %err,
                        "unable to serialize entry for relocation"
                    ),
                }
            }
        }
        tracing::info!(
            map = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "entry relocation complete"
        );
    }

    // ------------------------------------------------------------------
    // local operations
    // ------------------------------------------------------------------

    /// Look up a key, promoting the local entry to primary when it is not
    /// one already. Proxies fetch the value from a backup first. Returns
    /// `None` when the key is unknown or the promotion could not complete.
    pub async fn get(&self, key: &K) -> Option<V> {
        let (role, value, backups) = {
            let guard = self.entries.get(key)?;
            let e = guard.value();
            (e.role(), e.value().cloned(), e.backups().to_vec())
        };
        tracing::trace!(map = %self.name, key = ?key, role = ?role, "get");
        match role {
            EntryRole::Primary => value,
            EntryRole::Backup => {
                let key_raw = match message::encode(key) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize key");
                        return None;
                    }
                };
                let value_raw = match value.as_ref().map(message::encode).transpose() {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize value");
                        return None;
                    }
                };
                match self.publish_entry_info(&key_raw, value_raw.as_deref()).await {
                    Ok(new_backups) => {
                        {
                            let mut guard = self.entries.get_mut(key)?;
                            let e = guard.value_mut();
                            e.promote(self.local(), new_backups);
                            if let Some(v) = e.value_mut() {
                                v.owner_changed();
                            }
                        }
                        self.notify_owner_made_primary(key, value.as_ref());
                        value
                    }
                    Err(err) => {
                        tracing::error!(
                            map = %self.name,
                            key = ?key,
                            error = %err,
                            "unable to promote backup entry"
                        );
                        None
                    }
                }
            }
            EntryRole::Proxy => self.promote_proxy(key, backups).await,
            EntryRole::Copy => {
                let members = self.membership.members();
                if !members.is_empty() {
                    let key_raw = match message::encode(key) {
                        Ok(raw) => raw,
                        Err(err) => {
                            tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize key");
                            return None;
                        }
                    };
                    let msg = MapMessage::new(&self.map_id, MessageType::NotifyMapMember)
                        .with_key(key_raw)
                        .with_primary(self.local())
                        .with_backups(members.clone());
                    if let Err(err) = self.channel.send(&members, msg, self.send_options).await {
                        tracing::error!(
                            map = %self.name,
                            key = ?key,
                            error = %err,
                            "unable to announce copy promotion"
                        );
                        return None;
                    }
                }
                {
                    let mut guard = self.entries.get_mut(key)?;
                    let e = guard.value_mut();
                    e.promote(self.local(), members);
                    if let Some(v) = e.value_mut() {
                        v.owner_changed();
                    }
                }
                self.notify_owner_made_primary(key, value.as_ref());
                value
            }
        }
    }

    /// Proxy promotion: retrieve the value from the backup set, inform the
    /// backups they now back a local primary, and demote everyone else to
    /// proxies pointing here
    async fn promote_proxy(&self, key: &K, backups: Vec<MemberId>) -> Option<V> {
        let key_raw = match message::encode(key) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize key");
                return None;
            }
        };
        let msg =
            MapMessage::new(&self.map_id, MessageType::RetrieveBackup).with_key(key_raw.clone());
        let replies = match self
            .channel
            .send_rpc(
                &backups,
                msg,
                RpcMode::FirstReply,
                self.send_options,
                self.rpc_timeout,
            )
            .await
        {
            Ok(replies) => replies,
            Err(err) => {
                tracing::error!(map = %self.name, key = ?key, error = %err, "unable to retrieve remote value");
                return None;
            }
        };
        let Some(reply) = replies.into_iter().next() else {
            tracing::warn!(map = %self.name, key = ?key, "no backup answered the retrieve request");
            return None;
        };
        let fetched: Option<V> = match reply.message.decode_value() {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(map = %self.name, error = %err, "unable to deserialize retrieved value");
                return None;
            }
        };

        if !backups.is_empty() {
            let msg = MapMessage::new(&self.map_id, MessageType::NotifyMapMember)
                .with_key(key_raw.clone())
                .with_primary(self.local())
                .with_backups(backups.clone());
            if let Err(err) = self.channel.send(&backups, msg, self.send_options).await {
                tracing::error!(map = %self.name, key = ?key, error = %err, "unable to notify new backups");
                return None;
            }
        }
        // invalidate everyone else, the previous primary included
        let others = self.membership.members_excluding(&backups);
        if !others.is_empty() {
            let msg = MapMessage::new(&self.map_id, MessageType::Proxy)
                .with_key(key_raw)
                .with_primary(self.local())
                .with_backups(backups.clone());
            if let Err(err) = self.channel.send(&others, msg, self.send_options).await {
                tracing::error!(map = %self.name, key = ?key, error = %err, "unable to announce new primary");
                return None;
            }
        }

        let value = {
            let mut guard = self.entries.get_mut(key)?;
            let e = guard.value_mut();
            if let Some(value) = fetched {
                e.set_value(Some(value));
            }
            e.promote(self.local(), backups);
            if let Some(v) = e.value_mut() {
                v.owner_changed();
            }
            e.value().cloned()
        };
        self.notify_owner_made_primary(key, value.as_ref());
        value
    }

    /// Insert a key/value pair, replicating it to a backup set. Returns the
    /// previous value, if any.
    pub async fn put(&self, key: K, value: V) -> Option<V> {
        self.put_notify(key, value, true).await
    }

    /// Insert without replication when `notify` is false (local only)
    pub async fn put_notify(&self, key: K, value: V, notify: bool) -> Option<V> {
        let mut old = None;
        if self.entries.contains_key(&key) {
            old = self.remove_notify(&key, notify).await;
        }
        let mut entry = MapEntry::new(key.clone(), Some(value));
        entry.set_primary(Some(self.local()));

        if notify {
            match message::encode(&key)
                .and_then(|key_raw| {
                    let value_raw = entry.value().map(message::encode).transpose()?;
                    Ok((key_raw, value_raw))
                }) {
                Ok((key_raw, value_raw)) => {
                    match self.publish_entry_info(&key_raw, value_raw.as_deref()).await {
                        Ok(backups) => entry.set_backups(backups),
                        Err(err) => tracing::error!(
                            map = %self.name,
                            key = ?key,
                            error = %err,
                            "unable to replicate entry"
                        ),
                    }
                }
                Err(err) => tracing::error!(
                    map = %self.name,
                    key = ?key,
                    error = %err,
                    "unable to serialize entry"
                ),
            }
        }
        self.entries.insert(key, entry);
        old
    }

    /// Insert every pair from the iterator through the replicated path
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.put(key, value).await;
        }
    }

    /// Remove a key everywhere. Returns the previous local value, if any.
    pub async fn remove(&self, key: &K) -> Option<V> {
        self.remove_notify(key, true).await
    }

    /// Remove without broadcasting when `notify` is false (local only)
    pub async fn remove_notify(&self, key: &K, notify: bool) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, entry)| entry);
        let members = self.membership.members();
        if notify && !members.is_empty() {
            match message::encode(key) {
                Ok(key_raw) => {
                    let msg =
                        MapMessage::new(&self.map_id, MessageType::Remove).with_key(key_raw);
                    if let Err(err) = self.channel.send(&members, msg, self.send_options).await {
                        tracing::error!(
                            map = %self.name,
                            key = ?key,
                            error = %err,
                            "unable to broadcast remove"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize key");
                }
            }
        }
        removed.and_then(MapEntry::into_value)
    }

    /// Push changes of a primary entry to its backups.
    ///
    /// Diffable dirty values ship a diff; `complete` ships the whole value;
    /// access-replicating values that were merely touched ship metadata
    /// only. Non-primary entries and entries without backups are skipped.
    pub async fn replicate(&self, key: &K, complete: bool) {
        tracing::trace!(map = %self.name, key = ?key, complete, "replicate invoked");
        let built = {
            let Some(mut guard) = self.entries.get_mut(key) else {
                return;
            };
            let e = guard.value_mut();
            if !e.is_primary() || e.backups().is_empty() {
                return;
            }
            let dirty = e.value().map(|v| v.is_dirty()).unwrap_or(false);
            let access = e.value().map(|v| v.is_access_replicate()).unwrap_or(false);
            if !(complete || dirty || access) {
                tracing::trace!(map = %self.name, key = ?key, "no change, not replicating");
                return;
            }
            let key_raw = match message::encode(key) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize key");
                    return;
                }
            };
            let primary = e.primary().cloned();
            let backups = e.backups().to_vec();

            let mut msg: Option<MapMessage> = None;
            if e.is_diffable() && (dirty || complete) {
                let value = e.value_mut().expect("diffable entry has a value");
                match value.get_diff() {
                    Ok(diff) => {
                        value.reset_diff();
                        msg = Some(
                            MapMessage::new(&self.map_id, MessageType::Backup)
                                .with_key(key_raw.clone())
                                .with_diff(diff)
                                .with_primary_opt(primary.clone())
                                .with_backups(backups.clone()),
                        );
                    }
                    Err(err) => tracing::error!(
                        map = %self.name,
                        key = ?key,
                        error = %err,
                        "unable to diff entry value"
                    ),
                }
            }
            if msg.is_none() && complete {
                match e.value().map(message::encode).transpose() {
                    Ok(value_raw) => {
                        let mut m = MapMessage::new(&self.map_id, MessageType::Backup)
                            .with_key(key_raw.clone())
                            .with_primary_opt(primary.clone())
                            .with_backups(backups.clone());
                        if let Some(raw) = value_raw {
                            m = m.with_value(raw);
                        }
                        msg = Some(m);
                    }
                    Err(err) => {
                        tracing::error!(map = %self.name, key = ?key, error = %err, "unable to serialize value");
                        return;
                    }
                }
            }
            let msg = msg.unwrap_or_else(|| {
                MapMessage::new(&self.map_id, MessageType::Access)
                    .with_key(key_raw)
                    .with_primary_opt(primary)
                    .with_backups(backups.clone())
            });
            if let Some(v) = e.value_mut() {
                v.set_last_replicated(now_ms());
            }
            (msg, backups)
        };

        let (msg, backups) = built;
        if let Err(err) = self.channel.send(&backups, msg, self.send_options).await {
            tracing::error!(map = %self.name, key = ?key, error = %err, "unable to replicate entry");
        }
    }

    /// Run [`replicate`](Self::replicate) over every entry
    pub async fn replicate_all(&self, complete: bool) {
        for key in self.key_snapshot() {
            self.replicate(&key, complete).await;
        }
    }

    /// Remove every entry. Goes through the replicated path key by key, so
    /// only active entries on this node are cleared.
    pub async fn clear(&self) {
        self.clear_notify(true).await;
    }

    /// `clear(false)` drops local storage only
    pub async fn clear_notify(&self, notify: bool) {
        if notify {
            for key in self.keys() {
                self.remove(&key).await;
            }
        } else {
            self.entries.clear();
        }
    }

    /// Mutate the live value of an entry in place. This is how callers
    /// change a primary value before pushing it with `replicate`.
    pub fn with_value_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut guard = self.entries.get_mut(key)?;
        guard.value_mut().value_mut().map(f)
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// True if any entry exists for the key, proxies included (the entry is
    /// a lookup hint; `get` will fetch the value)
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Advisory scan comparing only active entries
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.entries.iter().any(|item| {
            let e = item.value();
            e.is_active() && e.value() == Some(value)
        })
    }

    /// Number of active entries holding a value
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|item| {
                let e = item.value();
                e.is_active() && e.value().is_some()
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries of any role, proxies included
    pub fn len_full(&self) -> usize {
        self.entries.len()
    }

    /// Keys of active entries holding a value
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|item| {
                let e = item.value();
                e.is_active() && e.value().is_some()
            })
            .map(|item| item.key().clone())
            .collect()
    }

    /// Every key, proxies included
    pub fn keys_full(&self) -> Vec<K> {
        self.key_snapshot()
    }

    /// Values of active entries
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter(|item| item.value().is_active())
            .filter_map(|item| item.value().value().cloned())
            .collect()
    }

    /// Key/value pairs of active entries holding a value
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter(|item| item.value().is_active())
            .filter_map(|item| {
                item.value()
                    .value()
                    .cloned()
                    .map(|v| (item.key().clone(), v))
            })
            .collect()
    }

    /// Full snapshots of every entry, role and placement included
    pub fn entries_full(&self) -> Vec<EntryView<K, V>> {
        self.entries
            .iter()
            .map(|item| EntryView::from(item.value()))
            .collect()
    }

    /// Full snapshot of one entry, any role
    pub fn entry_view(&self, key: &K) -> Option<EntryView<K, V>> {
        self.entries.get(key).map(|e| EntryView::from(&*e))
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The map context id carried on every message
    pub fn context_id(&self) -> &[u8] {
        &self.map_id
    }

    pub fn state(&self) -> MapState {
        self.state.load()
    }

    pub fn is_state_transferred(&self) -> bool {
        self.state_transferred.load(Ordering::SeqCst)
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn access_timeout(&self) -> Duration {
        self.access_timeout
    }

    pub fn send_options(&self) -> SendOptions {
        self.send_options
    }

    pub fn local_member(&self) -> MemberId {
        self.membership.local().clone()
    }

    /// Snapshot of the current map members
    pub fn map_members(&self) -> Vec<MemberId> {
        self.membership.members()
    }

    /// Register the owner callback fired on primary promotions
    pub fn set_map_owner(&self, owner: Arc<dyn MapOwner<K, V>>) {
        if let Ok(mut guard) = self.owner.write() {
            *guard = Some(owner);
        }
    }

    pub fn clear_map_owner(&self) {
        if let Ok(mut guard) = self.owner.write() {
            *guard = None;
        }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn local(&self) -> MemberId {
        self.membership.local().clone()
    }

    fn key_snapshot(&self) -> Vec<K> {
        self.entries.iter().map(|item| item.key().clone()).collect()
    }

    fn encoded_pair(&self, key: &K) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let key_raw = message::encode(key)?;
        let value_raw = match self.entries.get(key) {
            Some(guard) => guard.value().value().map(message::encode).transpose()?,
            None => None,
        };
        Ok((key_raw, value_raw))
    }

    async fn publish_entry_info(
        &self,
        key_raw: &[u8],
        value_raw: Option<&[u8]>,
    ) -> Result<Vec<MemberId>> {
        let ctx = PublishContext {
            channel: self.channel.as_ref(),
            membership: &self.membership,
            map_id: &self.map_id,
            options: self.send_options,
        };
        self.policy.publish_entry_info(ctx, key_raw, value_raw).await
    }

    fn notify_owner_made_primary(&self, key: &K, value: Option<&V>) {
        if let Ok(guard) = self.owner.read() {
            if let Some(owner) = guard.as_ref() {
                owner.object_made_primary(key, value);
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound dispatch
    // ------------------------------------------------------------------

    async fn handle_message(&self, msg: MapMessage, sender: MemberId) {
        tracing::trace!(
            map = %self.name,
            from = %sender,
            ty = msg.msg_type().name(),
            "message received"
        );
        match msg.msg_type() {
            MessageType::Start => {
                if let Some(primary) = msg.primary().cloned() {
                    self.map_member_added(&primary).await;
                }
            }
            MessageType::Stop => {
                if let Some(primary) = msg.primary().cloned() {
                    self.member_disappeared_inner(&primary).await;
                }
            }
            MessageType::Proxy => {
                let key: K = match msg.decode_key() {
                    Ok(Some(key)) => key,
                    Ok(None) => return,
                    Err(err) => {
                        tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                        return;
                    }
                };
                let value: Option<V> = match msg.decode_value() {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                        return;
                    }
                };
                let mut e = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| MapEntry::new(key, value));
                e.set_role(EntryRole::Proxy);
                e.set_backups(msg.backups().to_vec());
                e.set_primary(msg.primary().cloned());
            }
            MessageType::Remove => match msg.decode_key::<K>() {
                Ok(Some(key)) => {
                    self.entries.remove(&key);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                }
            },
            MessageType::Backup | MessageType::Copy => self.apply_backup_or_copy(&msg),
            MessageType::Access | MessageType::NotifyMapMember => match msg.decode_key::<K>() {
                Ok(Some(key)) => {
                    if let Some(mut guard) = self.entries.get_mut(&key) {
                        let e = guard.value_mut();
                        e.set_backups(msg.backups().to_vec());
                        e.set_primary(msg.primary().cloned());
                        if let Some(v) = e.value_mut() {
                            v.access_entry();
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                }
            },
            // INIT, PING, STATE, STATE_COPY and RETRIEVE_BACKUP only exist
            // as RPC requests; nothing to do on the async path
            _ => {}
        }
    }

    /// Create or update an entry from a BACKUP or COPY message. Diffs are
    /// applied through the value under the entry's exclusive section; a
    /// message without a value keeps whatever value is already there.
    fn apply_backup_or_copy(&self, msg: &MapMessage) {
        let key: K = match msg.decode_key() {
            Ok(Some(key)) => key,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                return;
            }
        };
        let incoming: Option<V> = match msg.decode_value() {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(map = %self.name, error = %err, "unable to deserialize map message");
                return;
            }
        };
        let role = if msg.msg_type() == MessageType::Backup {
            EntryRole::Backup
        } else {
            EntryRole::Copy
        };
        match self.entries.entry(key.clone()) {
            Slot::Vacant(slot) => {
                let mut e = MapEntry::new(key, incoming);
                e.set_role(role);
                e.set_backups(msg.backups().to_vec());
                e.set_primary(msg.primary().cloned());
                if let Some(v) = e.value_mut() {
                    v.owner_changed();
                }
                slot.insert(e);
            }
            Slot::Occupied(mut slot) => {
                let e = slot.get_mut();
                e.set_role(role);
                e.set_backups(msg.backups().to_vec());
                e.set_primary(msg.primary().cloned());
                if msg.is_diff() && e.is_diffable() {
                    if let Some(diff) = msg.diff_value() {
                        let value = e.value_mut().expect("diffable entry has a value");
                        if let Err(err) = value.apply_diff(diff) {
                            tracing::error!(
                                map = %self.name,
                                key = ?key,
                                error = %err,
                                "unable to apply diff to entry"
                            );
                        }
                    }
                } else if let Some(value) = incoming {
                    e.set_value(Some(value));
                    if let Some(v) = e.value_mut() {
                        v.owner_changed();
                    }
                } else if !msg.is_diff() {
                    // no payload at all: keep the value we have
                    if let Some(v) = e.value_mut() {
                        v.owner_changed();
                    }
                }
            }
        }
    }

    async fn handle_reply_request(
        &self,
        mut msg: MapMessage,
        sender: &MemberId,
    ) -> Option<MapMessage> {
        match msg.msg_type() {
            MessageType::Init => {
                msg.set_primary(Some(self.local()));
                Some(msg)
            }
            MessageType::Start => {
                msg.set_primary(Some(self.local()));
                self.map_member_added(sender).await;
                Some(msg)
            }
            MessageType::RetrieveBackup => {
                let key: K = match msg.decode_key() {
                    Ok(Some(key)) => key,
                    _ => return None,
                };
                let value_raw = {
                    let guard = self.entries.get(&key)?;
                    match guard.value().value().map(message::encode).transpose() {
                        Ok(raw) => raw,
                        Err(err) => {
                            tracing::error!(
                                map = %self.name,
                                key = ?key,
                                error = %err,
                                "unable to serialize value for retrieve reply"
                            );
                            return None;
                        }
                    }
                };
                msg.set_value_raw(value_raw);
                Some(msg)
            }
            MessageType::State | MessageType::StateCopy => {
                let _guard = self.state_mutex.lock().await;
                let full = msg.msg_type() == MessageType::StateCopy;
                let mut snapshot = Vec::new();
                for item in self.entries.iter() {
                    let e = item.value();
                    let key_raw = match message::encode(item.key()) {
                        Ok(raw) => raw,
                        Err(err) => {
                            tracing::error!(
                                map = %self.name,
                                key = ?item.key(),
                                error = %err,
                                "unable to serialize entry for state transfer"
                            );
                            continue;
                        }
                    };
                    let mut m = MapMessage::new(
                        &self.map_id,
                        if full {
                            MessageType::Copy
                        } else {
                            MessageType::Proxy
                        },
                    )
                    .with_key(key_raw)
                    .with_primary_opt(e.primary().cloned())
                    .with_backups(e.backups().to_vec());
                    if full {
                        match e.value().map(message::encode).transpose() {
                            Ok(Some(raw)) => m = m.with_value(raw),
                            Ok(None) => {}
                            Err(err) => {
                                tracing::error!(
                                    map = %self.name,
                                    key = ?item.key(),
                                    error = %err,
                                    "unable to serialize entry for state transfer"
                                );
                                continue;
                            }
                        }
                    }
                    snapshot.push(m);
                }
                match message::encode(&snapshot) {
                    Ok(payload) => {
                        msg.set_value_raw(Some(payload));
                        Some(msg)
                    }
                    Err(err) => {
                        tracing::error!(map = %self.name, error = %err, "unable to serialize state snapshot");
                        None
                    }
                }
            }
            MessageType::Ping => match message::encode(&self.state()) {
                Ok(payload) => {
                    msg.set_value_raw(Some(payload));
                    msg.set_primary(Some(self.local()));
                    Some(msg)
                }
                Err(err) => {
                    tracing::error!(map = %self.name, error = %err, "unable to serialize ping reply");
                    None
                }
            },
            _ => None,
        }
    }

    async fn handle_left_over(&self, msg: MapMessage, _sender: MemberId) {
        match msg.msg_type() {
            MessageType::Start => {
                if let Some(primary) = msg.primary().cloned() {
                    self.map_member_added(&primary).await;
                }
            }
            MessageType::Init => {
                if let Some(primary) = msg.primary().cloned() {
                    self.member_alive(&primary).await;
                }
            }
            MessageType::Ping => {
                if let (Some(primary), Ok(Some(state))) =
                    (msg.primary().cloned(), msg.decode_value::<MapState>())
                {
                    tracing::info!(map = %self.name, member = %primary, "late ping reply");
                    if state.is_available() {
                        self.member_alive(&primary).await;
                    }
                }
            }
            other => {
                tracing::debug!(map = %self.name, ty = other.name(), "ignoring left-over message");
            }
        }
    }
}

#[async_trait]
impl<K, V> MapListener for ReplicatedMap<K, V>
where
    K: MapKey,
    V: ReplicatedValue,
{
    fn map_id(&self) -> &[u8] {
        &self.map_id
    }

    fn accept(&self, message: &MapMessage) -> bool {
        message.map_id() == self.map_id.as_slice()
    }

    async fn message_received(&self, message: MapMessage, sender: MemberId) {
        if !self.accept(&message) {
            return;
        }
        self.handle_message(message, sender).await;
    }

    async fn reply_request(&self, message: MapMessage, sender: MemberId) -> Option<MapMessage> {
        if !self.accept(&message) {
            return None;
        }
        self.handle_reply_request(message, &sender).await
    }

    async fn left_over(&self, message: MapMessage, sender: MemberId) {
        if !self.accept(&message) {
            return;
        }
        self.handle_left_over(message, sender).await;
    }

    async fn member_disappeared(&self, member: MemberId) {
        self.member_disappeared_inner(&member).await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;

    async fn solo_map(name: &str) -> Arc<ReplicatedMap<String, String>> {
        let hub = LocalHub::new();
        let channel = hub.channel("solo");
        let map = ReplicatedMap::new(MapConfig::new(name), channel).unwrap();
        map.clone().init(false).await.unwrap();
        map
    }

    #[tokio::test]
    async fn test_put_get_on_single_node() {
        let map = solo_map("m1").await;
        assert!(map.put("k".to_string(), "v1".to_string()).await.is_none());
        assert_eq!(map.get(&"k".to_string()).await.unwrap(), "v1");

        let view = map.entry_view(&"k".to_string()).unwrap();
        assert_eq!(view.role, EntryRole::Primary);
        assert_eq!(view.primary.unwrap(), map.local_member());
        assert!(view.backups.is_empty());
    }

    #[tokio::test]
    async fn test_put_returns_previous_value() {
        let map = solo_map("m1").await;
        map.put("k".to_string(), "v1".to_string()).await;
        let old = map.put("k".to_string(), "v2".to_string()).await;
        assert_eq!(old.unwrap(), "v1");
        assert_eq!(map.get(&"k".to_string()).await.unwrap(), "v2");
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_returns_value() {
        let map = solo_map("m1").await;
        map.put("k".to_string(), "v".to_string()).await;
        assert_eq!(map.remove(&"k".to_string()).await.unwrap(), "v");
        assert!(map.remove(&"k".to_string()).await.is_none());
        assert!(map.get(&"k".to_string()).await.is_none());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_queries_skip_proxies() {
        let map = solo_map("m1").await;
        map.put("active".to_string(), "v".to_string()).await;

        // hand-deliver a proxy entry the way a remote primary would
        let proxy = MapMessage::new(b"m1", MessageType::Proxy)
            .with_key(message::encode(&"lazy".to_string()).unwrap())
            .with_primary(MemberId::new("remote"))
            .with_backups(vec![MemberId::new("remote")]);
        map.message_received(proxy, MemberId::new("remote")).await;

        assert_eq!(map.len(), 1);
        assert_eq!(map.len_full(), 2);
        assert!(map.contains_key(&"lazy".to_string()));
        assert_eq!(map.keys(), vec!["active".to_string()]);
        assert_eq!(map.keys_full().len(), 2);
        assert!(map.contains_value(&"v".to_string()));

        let view = map.entry_view(&"lazy".to_string()).unwrap();
        assert_eq!(view.role, EntryRole::Proxy);
        assert!(view.value.is_none());
    }

    #[tokio::test]
    async fn test_messages_for_other_maps_are_dropped() {
        let map = solo_map("m1").await;
        let foreign = MapMessage::new(b"other", MessageType::Remove)
            .with_key(message::encode(&"k".to_string()).unwrap());
        map.put("k".to_string(), "v".to_string()).await;
        map.message_received(foreign, MemberId::new("remote")).await;
        assert_eq!(map.get(&"k".to_string()).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_clear_local_only() {
        let map = solo_map("m1").await;
        map.put("a".to_string(), "1".to_string()).await;
        map.put("b".to_string(), "2".to_string()).await;
        map.clear_notify(false).await;
        assert_eq!(map.len_full(), 0);
    }

    #[tokio::test]
    async fn test_breakdown_is_idempotent() {
        let map = solo_map("m1").await;
        map.put("k".to_string(), "v".to_string()).await;
        map.breakdown().await;
        assert_eq!(map.state(), MapState::Destroyed);
        assert_eq!(map.len_full(), 0);
        map.breakdown().await;
        assert_eq!(map.state(), MapState::Destroyed);
    }

    #[tokio::test]
    async fn test_ping_reply_reports_lifecycle_state() {
        let map = solo_map("m1").await;
        let ping = MapMessage::new(b"m1", MessageType::Ping);
        let reply = map
            .reply_request(ping, MemberId::new("remote"))
            .await
            .unwrap();
        let state: MapState = reply.decode_value().unwrap().unwrap();
        assert_eq!(state, MapState::Initialized);
        assert_eq!(reply.primary().unwrap(), &map.local_member());
    }
}
