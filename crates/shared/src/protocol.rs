use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Address, BareAddress, MessageState, MessageType, PartType, StanzaId, StateKind,
};

/// A generic stanza child element as handed over by the transport layer.
/// This core never parses wire bytes; it only walks already-built trees.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|child| child.name == name && child.namespace == namespace)
    }

    pub fn children_named<'a>(
        &'a self,
        name: &'a str,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.children
            .iter()
            .filter(move |child| child.name == name && child.namespace == namespace)
    }
}

/// One incoming message stanza, already decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStanza {
    pub to: Option<Address>,
    pub from: Option<Address>,
    pub message_type: MessageType,
    pub id: Option<String>,
    pub extensions: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionsPayload {
    /// Id of the message being reacted to.
    pub id: String,
    pub reactions: Vec<String>,
}

/// A protocol extension recognized by the transformation pipeline,
/// resolved once at construction time from its `(name, namespace)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Extension {
    Body {
        text: String,
        language: Option<String>,
    },
    OutOfBand {
        url: String,
    },
    Correction {
        id: String,
    },
    Retraction {
        id: String,
    },
    Reactions(ReactionsPayload),
    Reply {
        id: String,
        to: Address,
    },
    Displayed {
        id: String,
    },
    DeliveryReceipt {
        id: String,
    },
    Fallback {
        for_namespace: String,
        body_start: Option<u32>,
        body_end: Option<u32>,
    },
    StanzaError {
        condition: Option<String>,
        text: Option<String>,
    },
    MucUser {
        real_address: Option<Address>,
    },
    OccupantId {
        id: String,
    },
}

/// Normalized description of one incoming event, the sole value object
/// crossing into the transformation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    pub received_at: DateTime<Utc>,
    pub to: Option<Address>,
    pub from: Option<Address>,
    /// The counterpart this event files under: the interlocutor for 1:1
    /// traffic, the room for group traffic.
    pub remote: Address,
    pub message_type: MessageType,
    pub message_id: Option<String>,
    pub stanza_id: Option<StanzaId>,
    pub occupant_id: Option<String>,
    /// Stable bare address of the sender, when one could be resolved.
    pub sender_identity: Option<BareAddress>,
    pub extensions: Vec<Extension>,
}

impl Transformation {
    pub fn from_bare(&self) -> Option<BareAddress> {
        self.from.as_ref().map(Address::to_bare)
    }

    pub fn from_resource(&self) -> Option<&str> {
        self.from.as_ref().and_then(|from| from.resource.as_deref())
    }

    pub fn to_bare(&self) -> Option<BareAddress> {
        self.to.as_ref().map(Address::to_bare)
    }

    pub fn outgoing(&self) -> bool {
        Some(self.remote.to_bare()) == self.to_bare()
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn correction(&self) -> Option<&str> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Correction { id } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn retraction(&self) -> Option<&str> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Retraction { id } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn reactions(&self) -> Option<&ReactionsPayload> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Reactions(payload) => Some(payload),
            _ => None,
        })
    }

    pub fn reply(&self) -> Option<(&str, &Address)> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Reply { id, to } => Some((id.as_str(), to)),
            _ => None,
        })
    }

    pub fn displayed(&self) -> Option<&str> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Displayed { id } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn delivery_receipt(&self) -> Option<&str> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::DeliveryReceipt { id } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn bodies(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.extensions.iter().filter_map(|extension| match extension {
            Extension::Body { text, language } => Some((text.as_str(), language.as_deref())),
            _ => None,
        })
    }

    pub fn out_of_band_urls(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().filter_map(|extension| match extension {
            Extension::OutOfBand { url } => Some(url.as_str()),
            _ => None,
        })
    }

    pub fn fallback_for(&self, namespace: &str) -> Option<(Option<u32>, Option<u32>)> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Fallback {
                for_namespace,
                body_start,
                body_end,
            } if for_namespace == namespace => Some((*body_start, *body_end)),
            _ => None,
        })
    }

    pub fn stanza_error(&self) -> Option<(Option<&str>, Option<&str>)> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::StanzaError { condition, text } => {
                Some((condition.as_deref(), text.as_deref()))
            }
            _ => None,
        })
    }

    pub fn has_muc_user(&self) -> bool {
        self.extensions
            .iter()
            .any(|extension| matches!(extension, Extension::MucUser { .. }))
    }

    fn state_sender(&self) -> (BareAddress, Option<String>) {
        match &self.from {
            Some(from) => (from.to_bare(), from.resource.clone()),
            None => (self.remote.to_bare(), None),
        }
    }
}

impl MessageState {
    pub fn delivered(transformation: &Transformation) -> Self {
        let (from_bare, from_resource) = transformation.state_sender();
        Self {
            from_bare,
            from_resource,
            kind: StateKind::Delivered,
            error_condition: None,
            error_text: None,
        }
    }

    pub fn displayed(transformation: &Transformation) -> Self {
        let (from_bare, from_resource) = transformation.state_sender();
        Self {
            from_bare,
            from_resource,
            kind: StateKind::Displayed,
            error_condition: None,
            error_text: None,
        }
    }

    pub fn error(transformation: &Transformation) -> Self {
        let (from_bare, from_resource) = transformation.state_sender();
        let (condition, text) = transformation.stanza_error().unwrap_or((None, None));
        Self {
            from_bare,
            from_resource,
            kind: StateKind::Error,
            error_condition: condition.map(str::to_owned),
            error_text: text.map(str::to_owned),
        }
    }
}

/// A finished call folded into the message model as regular history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogTransformation {
    pub received_at: DateTime<Utc>,
    pub to: Option<Address>,
    pub from: Option<Address>,
    pub remote: Address,
    /// The call session id doubles as the client message id.
    pub session_id: String,
    pub stanza_id: Option<StanzaId>,
    pub duration_seconds: i64,
    pub part_type: PartType,
}

impl CallLogTransformation {
    pub fn builder(
        remote: Address,
        to: Option<Address>,
        from: Option<Address>,
        session_id: impl Into<String>,
    ) -> CallLogTransformationBuilder {
        CallLogTransformationBuilder {
            received_at: Utc::now(),
            remote,
            to,
            from,
            session_id: session_id.into(),
            stanza_id: None,
            duration_seconds: 0,
            part_type: PartType::AudioCall,
        }
    }

    /// The equivalent message-shaped view used to file the call under the
    /// regular natural key.
    pub fn as_transformation(&self) -> Transformation {
        Transformation {
            received_at: self.received_at,
            to: self.to.clone(),
            from: self.from.clone(),
            remote: self.remote.clone(),
            message_type: MessageType::Normal,
            message_id: Some(self.session_id.clone()),
            stanza_id: self.stanza_id.clone(),
            occupant_id: None,
            sender_identity: self
                .from
                .as_ref()
                .map(Address::to_bare)
                .or_else(|| Some(self.remote.to_bare())),
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallLogTransformationBuilder {
    received_at: DateTime<Utc>,
    remote: Address,
    to: Option<Address>,
    from: Option<Address>,
    session_id: String,
    stanza_id: Option<StanzaId>,
    duration_seconds: i64,
    part_type: PartType,
}

impl CallLogTransformationBuilder {
    pub fn stanza_id(mut self, stanza_id: StanzaId) -> Self {
        self.stanza_id = Some(stanza_id);
        self
    }

    pub fn duration_seconds(mut self, seconds: i64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn missed_call(mut self) -> Self {
        self.duration_seconds = 0;
        self
    }

    pub fn video(mut self, video: bool) -> Self {
        self.part_type = if video {
            PartType::VideoCall
        } else {
            PartType::AudioCall
        };
        self
    }

    pub fn build(self) -> CallLogTransformation {
        CallLogTransformation {
            received_at: self.received_at,
            to: self.to,
            from: self.from,
            remote: self.remote,
            session_id: self.session_id,
            stanza_id: self.stanza_id,
            duration_seconds: self.duration_seconds,
            part_type: self.part_type,
        }
    }
}
