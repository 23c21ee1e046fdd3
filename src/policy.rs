//! Backup Selection
//!
//! Strategy seam deciding where an entry gets replicated when it is
//! published. The required strategy is round-robin single backup: one
//! member receives the full value, everyone else a proxy locator.

use async_trait::async_trait;

use crate::error::Result;
use crate::member::MemberId;
use crate::membership::Membership;
use crate::message::{MapMessage, MessageType};
use crate::transport::{GroupChannel, SendOptions};

/// Everything a policy needs to publish an entry
pub struct PublishContext<'a> {
    pub channel: &'a dyn GroupChannel,
    pub membership: &'a Membership,
    pub map_id: &'a [u8],
    pub options: SendOptions,
}

/// Strategy for choosing and informing backup nodes.
///
/// Called when a primary entry needs backups: on `put`, when a member joins
/// and unreplicated entries catch up, and when a backup disappears. The
/// policy ships the entry to the chosen members and returns the backup list
/// recorded on the entry. Key and value arrive pre-encoded so policies stay
/// independent of the map's key/value types.
#[async_trait]
pub trait BackupPolicy: Send + Sync {
    async fn publish_entry_info(
        &self,
        ctx: PublishContext<'_>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Vec<MemberId>>;
}

/// Round-robin single backup.
///
/// Advances the membership cursor, sends the full value to the chosen
/// member as BACKUP, announces the placement to every other live member as
/// PROXY, and returns the single-element backup list. With no live members
/// the entry stays unreplicated and nothing is sent.
pub struct RoundRobinBackup;

#[async_trait]
impl BackupPolicy for RoundRobinBackup {
    async fn publish_entry_info(
        &self,
        ctx: PublishContext<'_>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Vec<MemberId>> {
        let Some(backup) = ctx.membership.next_backup() else {
            return Ok(Vec::new());
        };
        let local = ctx.channel.local_member();
        let backups = vec![backup.clone()];

        let mut msg = MapMessage::new(ctx.map_id, MessageType::Backup)
            .with_key(key.to_vec())
            .with_primary(local.clone())
            .with_backups(backups.clone());
        if let Some(value) = value {
            msg = msg.with_value(value.to_vec());
        }
        ctx.channel.send(&backups, msg, ctx.options).await?;

        let proxies = ctx.membership.members_excluding(&backups);
        if !proxies.is_empty() {
            let msg = MapMessage::new(ctx.map_id, MessageType::Proxy)
                .with_key(key.to_vec())
                .with_primary(local)
                .with_backups(backups.clone());
            ctx.channel.send(&proxies, msg, ctx.options).await?;
        }
        Ok(backups)
    }
}
