//! In-Process Loopback Channel
//!
//! Reference implementation of [`GroupChannel`] that routes messages
//! between maps living in the same process. Embedders use it to run
//! several maps without a network stack; the integration tests use it to
//! drive whole clusters deterministically. Delivery is synchronous and
//! per-sender FIFO, which matches the ordering contract real transports
//! must provide.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::member::MemberId;
use crate::message::MapMessage;
use crate::transport::{GroupChannel, MapListener, RpcMode, RpcReply, SendOptions};

type Listeners = HashMap<MemberId, Vec<Arc<dyn MapListener>>>;

/// Shared hub connecting all loopback channels in a process.
///
/// Cheap to clone; all clones see the same registry.
#[derive(Clone)]
pub struct LocalHub {
    nodes: Arc<RwLock<Listeners>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the channel endpoint for a member, registering it on the hub
    pub fn channel(&self, member: impl Into<MemberId>) -> Arc<LocalChannel> {
        let local = member.into();
        self.write().entry(local.clone()).or_default();
        Arc::new(LocalChannel {
            hub: self.clone(),
            local,
        })
    }

    /// Drop a member without any farewell message, simulating a crash
    pub fn crash(&self, member: &MemberId) {
        self.write().remove(member);
    }

    /// Members currently registered on the hub
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self.read().keys().cloned().collect();
        members.sort();
        members
    }

    /// Listeners of `member` accepting `message`; `None` if the member is gone
    fn listeners_for(
        &self,
        member: &MemberId,
        message: &MapMessage,
    ) -> Option<Vec<Arc<dyn MapListener>>> {
        let nodes = self.read();
        let listeners = nodes.get(member)?;
        Some(
            listeners
                .iter()
                .filter(|l| l.accept(message))
                .cloned()
                .collect(),
        )
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Listeners> {
        self.nodes.read().expect("hub lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Listeners> {
        self.nodes.write().expect("hub lock poisoned")
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-member endpoint on a [`LocalHub`]
pub struct LocalChannel {
    hub: LocalHub,
    local: MemberId,
}

impl LocalChannel {
    async fn deliver_replies(
        &self,
        mode: RpcMode,
        targets: &[MemberId],
        message: &MapMessage,
    ) -> Vec<RpcReply> {
        let mut replies = Vec::new();
        let mut late = Vec::new();
        for target in targets {
            let Some(listeners) = self.hub.listeners_for(target, message) else {
                continue;
            };
            for listener in listeners {
                if let Some(reply) = listener
                    .reply_request(message.clone(), self.local.clone())
                    .await
                {
                    if mode == RpcMode::FirstReply && !replies.is_empty() {
                        late.push(RpcReply {
                            source: target.clone(),
                            message: reply,
                        });
                    } else {
                        replies.push(RpcReply {
                            source: target.clone(),
                            message: reply,
                        });
                    }
                }
            }
        }
        // replies beyond the first-reply window go to the caller's own
        // listeners, the way an RPC layer hands out stragglers
        for reply in late {
            if let Some(listeners) = self.hub.listeners_for(&self.local, &reply.message) {
                for listener in listeners {
                    listener
                        .left_over(reply.message.clone(), reply.source.clone())
                        .await;
                }
            }
        }
        replies
    }
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn local_member(&self) -> MemberId {
        self.local.clone()
    }

    fn members(&self) -> Vec<MemberId> {
        self.hub
            .members()
            .into_iter()
            .filter(|m| *m != self.local)
            .collect()
    }

    async fn send(
        &self,
        to: &[MemberId],
        message: MapMessage,
        _options: SendOptions,
    ) -> Result<()> {
        let mut faulty = Vec::new();
        for target in to {
            match self.hub.listeners_for(target, &message) {
                Some(listeners) => {
                    for listener in listeners {
                        listener
                            .message_received(message.clone(), self.local.clone())
                            .await;
                    }
                }
                None => faulty.push(target.clone()),
            }
        }
        if faulty.is_empty() {
            Ok(())
        } else {
            Err(Error::FaultyMembers {
                reason: "destination not registered on hub".into(),
                faulty,
            })
        }
    }

    async fn send_rpc(
        &self,
        to: &[MemberId],
        message: MapMessage,
        mode: RpcMode,
        _options: SendOptions,
        timeout: Duration,
    ) -> Result<Vec<RpcReply>> {
        let faulty: Vec<MemberId> = {
            let nodes = self.hub.read();
            to.iter()
                .filter(|m| !nodes.contains_key(*m))
                .cloned()
                .collect()
        };
        if !faulty.is_empty() {
            return Err(Error::FaultyMembers {
                reason: "destination not registered on hub".into(),
                faulty,
            });
        }
        // loopback replies are immediate; the timeout only bounds a
        // listener that itself blocks
        match tokio::time::timeout(timeout, self.deliver_replies(mode, to, &message)).await {
            Ok(replies) => Ok(replies),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    fn attach(&self, listener: Arc<dyn MapListener>) {
        self.hub
            .write()
            .entry(self.local.clone())
            .or_default()
            .push(listener);
    }

    fn detach(&self, map_id: &[u8]) {
        let mut nodes = self.hub.write();
        if let Some(listeners) = nodes.get_mut(&self.local) {
            listeners.retain(|l| l.map_id() != map_id);
            if listeners.is_empty() {
                nodes.remove(&self.local);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::sync::Mutex;

    struct Recorder {
        map_id: Vec<u8>,
        received: Mutex<Vec<(MessageType, MemberId)>>,
    }

    impl Recorder {
        fn new(map_id: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                map_id: map_id.to_vec(),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MapListener for Recorder {
        fn map_id(&self) -> &[u8] {
            &self.map_id
        }

        fn accept(&self, message: &MapMessage) -> bool {
            message.map_id() == self.map_id
        }

        async fn message_received(&self, message: MapMessage, sender: MemberId) {
            self.received
                .lock()
                .unwrap()
                .push((message.msg_type(), sender));
        }

        async fn reply_request(&self, message: MapMessage, _sender: MemberId) -> Option<MapMessage> {
            Some(message)
        }

        async fn left_over(&self, _message: MapMessage, _sender: MemberId) {}

        async fn member_disappeared(&self, _member: MemberId) {}
    }

    #[tokio::test]
    async fn test_send_routes_by_map_id() {
        let hub = LocalHub::new();
        let a = hub.channel("a");
        let b = hub.channel("b");

        let listener = Recorder::new(b"m1");
        let other = Recorder::new(b"m2");
        b.attach(listener.clone());
        b.attach(other.clone());

        a.send(
            &[MemberId::new("b")],
            MapMessage::new(b"m1", MessageType::Remove),
            SendOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(listener.received.lock().unwrap().len(), 1);
        assert!(other.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_reports_faulty_members() {
        let hub = LocalHub::new();
        let a = hub.channel("a");
        hub.channel("b").attach(Recorder::new(b"m1"));
        hub.crash(&MemberId::new("b"));

        let err = a
            .send(
                &[MemberId::new("b")],
                MapMessage::new(b"m1", MessageType::Remove),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.faulty_members(), &[MemberId::new("b")]);
    }

    #[tokio::test]
    async fn test_rpc_reply_modes() {
        let hub = LocalHub::new();
        let a = hub.channel("a");
        hub.channel("b").attach(Recorder::new(b"m1"));
        hub.channel("c").attach(Recorder::new(b"m1"));

        let replies = a
            .send_rpc(
                &[MemberId::new("b"), MemberId::new("c")],
                MapMessage::new(b"m1", MessageType::Ping),
                RpcMode::FirstReply,
                SendOptions::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);

        let replies = a
            .send_rpc(
                &[MemberId::new("b"), MemberId::new("c")],
                MapMessage::new(b"m1", MessageType::Ping),
                RpcMode::AllReply,
                SendOptions::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_removes_empty_node() {
        let hub = LocalHub::new();
        let b = hub.channel("b");
        b.attach(Recorder::new(b"m1"));
        assert_eq!(hub.members(), vec![MemberId::new("b")]);

        b.detach(b"m1");
        assert!(hub.members().is_empty());
    }
}
