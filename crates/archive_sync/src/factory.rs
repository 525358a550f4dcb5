use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::trace;

use shared::domain::{Address, BareAddress, MessageType, StanzaId};
use shared::protocol::{Element, Extension, MessageStanza, ReactionsPayload, Transformation};

use crate::identity::ParticipantResolver;
use crate::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Archive,
}

/// Builds `Transformation` values from raw stanzas: resolves extensions
/// once via their `(name, namespace)` pair, computes the counterpart the
/// event files under, and pins the sender to a stable address when the
/// available evidence allows it.
pub struct TransformationFactory<R> {
    account: BareAddress,
    resolver: Arc<R>,
    mode: Mode,
}

impl<R: ParticipantResolver> TransformationFactory<R> {
    pub fn new(account: BareAddress, resolver: Arc<R>, mode: Mode) -> Self {
        Self {
            account,
            resolver,
            mode,
        }
    }

    pub async fn create_live(
        &self,
        stanza: &MessageStanza,
        stanza_id: Option<StanzaId>,
    ) -> Result<Transformation> {
        anyhow::ensure!(
            self.mode == Mode::Live,
            "automatic timestamps are only allowed in live mode"
        );
        self.create(stanza, stanza_id, Utc::now(), None).await
    }

    pub async fn create(
        &self,
        stanza: &MessageStanza,
        stanza_id: Option<StanzaId>,
        received_at: DateTime<Utc>,
        privileged_extensions: Option<&[Element]>,
    ) -> Result<Transformation> {
        anyhow::ensure!(
            privileged_extensions.is_none() || self.mode == Mode::Archive,
            "privileged extensions can only be supplied in archive mode"
        );
        let from = stanza.from.clone();
        let to = stanza.to.clone();
        let remote = match &from {
            None => to
                .clone()
                .unwrap_or_else(|| Address::from(self.account.clone())),
            Some(from_address) if from_address.bare == self.account => to
                .clone()
                .unwrap_or_else(|| Address::from(self.account.clone())),
            Some(from_address) => from_address.clone(),
        };

        let extensions = resolve_extensions(&stanza.extensions);

        // occupant ids only count when the room actually advertises the
        // feature; otherwise any client could claim one
        let occupant_id = if stanza.message_type == MessageType::Groupchat {
            let claimed = extensions.iter().find_map(|extension| match extension {
                Extension::OccupantId { id } => Some(id.clone()),
                _ => None,
            });
            match (claimed, &from) {
                (Some(id), Some(from_address)) => {
                    if self
                        .resolver
                        .supports_occupant_ids(&from_address.bare)
                        .await?
                    {
                        Some(id)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        } else {
            None
        };

        let sender_identity = self
            .resolve_sender_identity(
                stanza,
                &from,
                occupant_id.as_deref(),
                privileged_extensions,
            )
            .await?;

        Ok(Transformation {
            received_at,
            to,
            from,
            remote,
            message_type: stanza.message_type,
            message_id: stanza.id.clone(),
            stanza_id,
            occupant_id,
            sender_identity,
            extensions,
        })
    }

    /// Sender identity precedence for group traffic: the privileged
    /// real address the archive attached (archive mode) wins over an
    /// occupant-id directory lookup, which wins over a resource presence
    /// lookup (live mode only). An unresolvable occupant-id does not fall
    /// back to the resource.
    async fn resolve_sender_identity(
        &self,
        stanza: &MessageStanza,
        from: &Option<Address>,
        occupant_id: Option<&str>,
        privileged_extensions: Option<&[Element]>,
    ) -> Result<Option<BareAddress>> {
        if stanza.message_type != MessageType::Groupchat {
            return Ok(Some(
                from.as_ref()
                    .map(Address::to_bare)
                    .unwrap_or_else(|| self.account.clone()),
            ));
        }
        let Some(from) = from else {
            return Ok(None);
        };
        let room = from.to_bare();
        if self.mode == Mode::Archive {
            if let Some(elements) = privileged_extensions {
                let real = resolve_extensions(elements)
                    .into_iter()
                    .find_map(|extension| match extension {
                        Extension::MucUser {
                            real_address: Some(address),
                        } => Some(address.to_bare()),
                        _ => None,
                    });
                if let Some(real) = real {
                    return Ok(Some(real));
                }
            }
        }
        if let Some(occupant_id) = occupant_id {
            return self
                .resolver
                .real_address_by_occupant_id(&room, occupant_id)
                .await;
        }
        if self.mode == Mode::Live {
            if let Some(resource) = &from.resource {
                return self.resolver.real_address_by_resource(&room, resource).await;
            }
        }
        Ok(None)
    }
}

pub fn resolve_extensions(elements: &[Element]) -> Vec<Extension> {
    elements.iter().filter_map(resolve_extension).collect()
}

fn resolve_extension(element: &Element) -> Option<Extension> {
    match (element.name.as_str(), element.namespace.as_str()) {
        ("body", ns::CLIENT) => Some(Extension::Body {
            text: element.text.clone().unwrap_or_default(),
            language: element.attribute("xml:lang").map(str::to_owned),
        }),
        ("x", ns::OOB) => {
            let url = element.child("url", ns::OOB).and_then(|child| child.text.clone())?;
            Some(Extension::OutOfBand { url })
        }
        ("replace", ns::CORRECT) => Some(Extension::Correction {
            id: element.attribute("id")?.to_owned(),
        }),
        ("retract", ns::RETRACT) => Some(Extension::Retraction {
            id: element.attribute("id")?.to_owned(),
        }),
        ("reactions", ns::REACTIONS) => {
            let id = element.attribute("id")?.to_owned();
            let reactions = element
                .children_named("reaction", ns::REACTIONS)
                .filter_map(|child| child.text.clone())
                .collect();
            Some(Extension::Reactions(ReactionsPayload { id, reactions }))
        }
        ("reply", ns::REPLY) => {
            let id = element.attribute("id")?.to_owned();
            let to = element.attribute("to")?.parse().ok()?;
            Some(Extension::Reply { id, to })
        }
        ("displayed", ns::MARKERS) => Some(Extension::Displayed {
            id: element.attribute("id")?.to_owned(),
        }),
        ("received", ns::RECEIPTS) => Some(Extension::DeliveryReceipt {
            id: element.attribute("id")?.to_owned(),
        }),
        ("fallback", ns::FALLBACK) => {
            let for_namespace = element.attribute("for")?.to_owned();
            let body = element.child("body", ns::FALLBACK);
            let offset = |name: &str| {
                body.and_then(|body| body.attribute(name))
                    .and_then(|value| value.parse().ok())
            };
            Some(Extension::Fallback {
                for_namespace,
                body_start: offset("start"),
                body_end: offset("end"),
            })
        }
        ("error", ns::CLIENT) => {
            let condition = element
                .children
                .iter()
                .find(|child| child.namespace == ns::STANZAS && child.name != "text")
                .map(|child| child.name.clone());
            let text = element
                .child("text", ns::STANZAS)
                .and_then(|child| child.text.clone());
            Some(Extension::StanzaError { condition, text })
        }
        ("x", ns::MUC_USER) => {
            let real_address = element
                .child("item", ns::MUC_USER)
                .and_then(|item| item.attribute("jid"))
                .and_then(|jid| jid.parse().ok());
            Some(Extension::MucUser { real_address })
        }
        ("occupant-id", ns::OCCUPANT_ID) => Some(Extension::OccupantId {
            id: element.attribute("id")?.to_owned(),
        }),
        _ => {
            trace!(
                name = %element.name,
                namespace = %element.namespace,
                "unhandled extension"
            );
            None
        }
    }
}
