use anyhow::Result;
use tracing::{info, warn};

use shared::domain::{
    Account, BareAddress, MessageContent, MessageState, MessageType, Modification, QueryResult,
    Range,
};
use shared::protocol::{CallLogTransformation, Transformation};
use storage::{ChatIdentifier, MessageWriter, Storage, StoreError};

pub mod content;
pub mod factory;
pub mod identity;
pub mod ns;

pub use factory::{Mode, TransformationFactory};
pub use identity::ParticipantResolver;

/// Folds normalized incoming events into the versioned message store.
/// Every call runs inside one transaction; applying the same event twice
/// is observably identical to applying it once.
pub struct Transformer {
    storage: Storage,
    account: Account,
}

impl Transformer {
    pub fn new(storage: Storage, account: Account) -> Self {
        Self { storage, account }
    }

    /// Applies one event delivered via live push. Returns true when
    /// something was stored that a delivery receipt is owed for — new
    /// message content, or a state update that was actually new.
    /// Malformed events are dropped and return false; only store failures
    /// surface as errors, in which case nothing was committed and the
    /// event must be redelivered.
    pub async fn transform(&self, transformation: &Transformation) -> Result<bool> {
        self.transform_inner(transformation, true).await
    }

    /// Applies every transformation of one fetched archive page, then
    /// records the page outcome with the range tracker. Page events do not
    /// touch the live page; the submitted boundaries carry their anchors.
    pub async fn transform_page(
        &self,
        transformations: &[Transformation],
        archive: &BareAddress,
        range: &Range,
        query_result: &QueryResult,
        is_catchup: bool,
    ) -> Result<()> {
        for transformation in transformations {
            self.transform_inner(transformation, false).await?;
        }
        self.storage
            .submit_page(self.account.id, archive, range, query_result, is_catchup)
            .await
    }

    async fn transform_inner(&self, transformation: &Transformation, live: bool) -> Result<bool> {
        let mut writer = self.storage.writer().await?;
        let receipt_owed = self.apply(&mut writer, transformation).await?;
        if live {
            if let Some(stanza) = &transformation.stanza_id {
                writer
                    .record_live_anchor(self.account.id, &stanza.by, &stanza.id)
                    .await?;
            }
        }
        writer.commit().await?;
        Ok(receipt_owed)
    }

    /// Files a finished call under the regular message natural key, so
    /// call history replays from the archive merge instead of duplicating.
    pub async fn transform_call_log(&self, call: &CallLogTransformation) -> Result<()> {
        let transformation = call.as_transformation();
        let mut writer = self.storage.writer().await?;
        let chat = writer
            .get_or_create_chat(
                self.account.id,
                &transformation.remote.to_bare(),
                transformation.message_type,
                false,
            )
            .await?;
        let sender_key = identity::sender_key(&transformation, true);
        let identifier = match writer
            .get_or_create_message(&chat, &transformation, &sender_key)
            .await
        {
            Ok(identifier) => identifier,
            Err(StoreError::Conflict) => {
                warn!(session = %call.session_id, "dropping ambiguous call log entry");
                writer.rollback().await?;
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        writer
            .insert_message_content(
                &identifier,
                &[MessageContent::call(call.part_type, call.duration_seconds)],
            )
            .await?;
        if let Some(stanza) = &call.stanza_id {
            writer
                .record_live_anchor(self.account.id, &stanza.by, &stanza.id)
                .await?;
        }
        writer.commit().await?;
        Ok(())
    }

    async fn apply(
        &self,
        writer: &mut MessageWriter<'_>,
        transformation: &Transformation,
    ) -> Result<bool> {
        let chat = writer
            .get_or_create_chat(
                self.account.id,
                &transformation.remote.to_bare(),
                transformation.message_type,
                transformation.has_muc_user(),
            )
            .await?;

        if transformation.message_type == MessageType::Error {
            if transformation.outgoing() {
                info!(to = ?transformation.to, "ignoring outgoing error");
                return Ok(false);
            }
            if let Some(target) = transformation.message_id.as_deref() {
                writer
                    .insert_message_state(&chat, target, &MessageState::error(transformation))
                    .await?;
            }
            return Ok(false);
        }

        let identifiable = identity::is_identifiable_sender(&chat, transformation);
        let sender_key = identity::sender_key(transformation, identifiable);
        let (contents, fallback_span) = content::parse_contents(transformation);

        if identifiable {
            if let Some(target) = transformation.retraction() {
                let identifier = match writer
                    .get_or_create_version(
                        &chat,
                        transformation,
                        target,
                        Modification::Retraction,
                        &sender_key,
                    )
                    .await
                {
                    Ok(identifier) => identifier,
                    Err(StoreError::Conflict) => {
                        warn!(target_id = target, "could not resolve retraction target");
                        return Ok(false);
                    }
                    Err(error) => return Err(error.into()),
                };
                writer
                    .insert_message_content(&identifier, &[MessageContent::retraction()])
                    .await?;
                return Ok(true);
            }
        }

        if contents.is_empty() {
            info!(from = ?transformation.from, "received message without contents");
            let receipt_owed = self
                .apply_message_state(writer, &chat, transformation)
                .await?;
            if identifiable {
                if let Some(payload) = transformation.reactions() {
                    writer
                        .insert_reactions(&chat, payload, transformation, &sender_key)
                        .await?;
                }
            }
            return Ok(receipt_owed);
        }

        let correction = if identifiable {
            transformation.correction()
        } else {
            None
        };
        let resolved = match correction {
            Some(target) => {
                writer
                    .get_or_create_version(
                        &chat,
                        transformation,
                        target,
                        Modification::Correction,
                        &sender_key,
                    )
                    .await
            }
            None => {
                writer
                    .get_or_create_message(&chat, transformation, &sender_key)
                    .await
            }
        };
        let identifier = match resolved {
            Ok(identifier) => identifier,
            Err(StoreError::Conflict) => {
                warn!(
                    message_id = ?transformation.message_id,
                    "could not resolve message identifier"
                );
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
        };
        writer.insert_message_content(&identifier, &contents).await?;
        if let Some((reply_id, reply_to)) = transformation.reply() {
            writer
                .set_in_reply_to(&chat, &identifier, reply_to, reply_id, fallback_span)
                .await?;
        }
        Ok(true)
    }

    async fn apply_message_state(
        &self,
        writer: &mut MessageWriter<'_>,
        chat: &ChatIdentifier,
        transformation: &Transformation,
    ) -> Result<bool, StoreError> {
        let mut receipt_owed = false;
        if let Some(target) = transformation.displayed() {
            if transformation.outgoing() {
                info!(remote = %transformation.remote, "received outgoing displayed marker");
                return Ok(false);
            }
            receipt_owed |= writer
                .insert_message_state(chat, target, &MessageState::displayed(transformation))
                .await?;
        }
        if let Some(target) = transformation.delivery_receipt() {
            if transformation.outgoing() {
                info!(to = ?transformation.to, "ignoring outgoing delivery receipt");
                return Ok(receipt_owed);
            }
            receipt_owed |= writer
                .insert_message_state(chat, target, &MessageState::delivered(transformation))
                .await?;
        }
        Ok(receipt_owed)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/factory_tests.rs"]
mod factory_tests;
