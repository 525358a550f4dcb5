use async_trait::async_trait;

use shared::domain::{BareAddress, ChatType};
use shared::protocol::Transformation;
use storage::ChatIdentifier;

/// Directory lookups for pinning room occupants to stable addresses.
/// Backed by presence/roster bookkeeping outside this crate.
#[async_trait]
pub trait ParticipantResolver: Send + Sync {
    async fn real_address_by_occupant_id(
        &self,
        room: &BareAddress,
        occupant_id: &str,
    ) -> anyhow::Result<Option<BareAddress>>;

    async fn real_address_by_resource(
        &self,
        room: &BareAddress,
        resource: &str,
    ) -> anyhow::Result<Option<BareAddress>>;

    /// Whether the room advertises server-assigned stable occupant ids.
    async fn supports_occupant_ids(&self, room: &BareAddress) -> anyhow::Result<bool>;
}

/// A sender can be pinned to a stable address in one-to-one chats always,
/// and in group chats only when the room is members-only, non-anonymous,
/// and a bare address was resolved for this event.
pub fn is_identifiable_sender(chat: &ChatIdentifier, transformation: &Transformation) -> bool {
    match chat.chat_type {
        ChatType::Individual | ChatType::Broadcast => true,
        ChatType::Group | ChatType::GroupPrivateMessage => {
            chat.members_only_non_anonymous && transformation.sender_identity.is_some()
        }
    }
}

/// The key sender-scoped rows are stored under: the stable bare address
/// for identifiable senders, otherwise the occupant resource — a weaker
/// key that stops matching once that occupant's presence is gone.
pub fn sender_key(transformation: &Transformation, identifiable: bool) -> String {
    if identifiable {
        if let Some(identity) = &transformation.sender_identity {
            return identity.0.clone();
        }
        if let Some(bare) = transformation.from_bare() {
            return bare.0;
        }
        return transformation.remote.to_bare().0;
    }
    if let Some(resource) = transformation.from_resource() {
        return resource.to_owned();
    }
    if let Some(bare) = transformation.from_bare() {
        return bare.0;
    }
    transformation.remote.to_bare().0
}
