use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(AccountId);
id_newtype!(ChatId);
id_newtype!(MessageId);
id_newtype!(VersionId);

/// An address without a resource part, e.g. `juliet@example.com` or a
/// room address. Stable across sessions; the strongest sender key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BareAddress(pub String);

impl BareAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A full address: bare part plus an optional session resource. In group
/// chats the resource carries the occupant nickname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub bare: BareAddress,
    pub resource: Option<String>,
}

impl Address {
    pub fn bare(value: impl Into<String>) -> Self {
        Self {
            bare: BareAddress::new(value),
            resource: None,
        }
    }

    pub fn full(bare: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            bare: BareAddress::new(bare),
            resource: Some(resource.into()),
        }
    }

    pub fn to_bare(&self) -> BareAddress {
        self.bare.clone()
    }

    pub fn has_resource(&self) -> bool {
        self.resource.is_some()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match value.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (value, None),
        };
        if bare.is_empty() {
            return Err(AddressError::Empty);
        }
        if matches!(resource, Some("")) {
            return Err(AddressError::EmptyResource);
        }
        Ok(Self {
            bare: BareAddress::new(bare),
            resource: resource.map(str::to_owned),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}/{resource}", self.bare),
            None => f.write_str(self.bare.as_str()),
        }
    }
}

impl From<BareAddress> for Address {
    fn from(bare: BareAddress) -> Self {
        Self {
            bare,
            resource: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Individual,
    Group,
    GroupPrivateMessage,
    Broadcast,
}

impl ChatType {
    /// Maps an incoming event onto the chat it belongs to. A private
    /// message inside a room is recognized by the muc-user marker on a
    /// non-groupchat stanza.
    pub fn of(message_type: MessageType, has_muc_user: bool) -> Self {
        match message_type {
            MessageType::Groupchat => ChatType::Group,
            MessageType::Headline => ChatType::Broadcast,
            _ if has_muc_user => ChatType::GroupPrivateMessage,
            _ => ChatType::Individual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

/// How a content version relates to the message identity it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modification {
    Original,
    Correction,
    Retraction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Delivered,
    Displayed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    Text,
    File,
    Retraction,
    AudioCall,
    VideoCall,
}

/// One ordered part of a message version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub part_type: PartType,
    pub language: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    /// Byte size for file parts, duration in seconds for call parts.
    pub size: Option<i64>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>, language: Option<String>) -> Self {
        Self {
            part_type: PartType::Text,
            language,
            body: Some(body.into()),
            url: None,
            size: None,
        }
    }

    pub fn file(url: impl Into<String>) -> Self {
        Self {
            part_type: PartType::File,
            language: None,
            body: None,
            url: Some(url.into()),
            size: None,
        }
    }

    pub fn retraction() -> Self {
        Self {
            part_type: PartType::Retraction,
            language: None,
            body: None,
            url: None,
            size: None,
        }
    }

    pub fn call(part_type: PartType, duration_seconds: i64) -> Self {
        Self {
            part_type,
            language: None,
            body: None,
            url: None,
            size: Some(duration_seconds),
        }
    }
}

/// A delivery/read/error marker left on a message version by one sender
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub from_bare: BareAddress,
    pub from_resource: Option<String>,
    pub kind: StateKind,
    pub error_condition: Option<String>,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub reaction_by: Option<BareAddress>,
    pub reaction_by_resource: Option<String>,
    pub occupant_id: Option<String>,
    pub reaction: String,
}

/// A server-assigned archive id together with the archive that assigned
/// it. The account's own address for 1:1 history, the room address for
/// group history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaId {
    pub id: String,
    pub by: BareAddress,
}

impl StanzaId {
    pub fn new(id: impl Into<String>, by: BareAddress) -> Self {
        Self { id: id.into(), by }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Walk toward older history from the oldest known anchor.
    Reverse,
    /// Walk toward newer history from the newest known anchor.
    Normal,
}

/// One pending page request against a remote archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub direction: Direction,
    pub anchor: Option<String>,
}

impl Range {
    pub fn reverse(anchor: Option<String>) -> Self {
        Self {
            direction: Direction::Reverse,
            anchor,
        }
    }

    pub fn normal(anchor: Option<String>) -> Self {
        Self {
            direction: Direction::Normal,
            anchor,
        }
    }
}

/// The id boundaries of one fetched archive page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub count: Option<u32>,
}

impl Page {
    pub fn new(first_id: impl Into<String>, last_id: impl Into<String>, count: u32) -> Self {
        Self {
            first_id: Some(first_id.into()),
            last_id: Some(last_id.into()),
            count: Some(count),
        }
    }

    pub fn empty(count: Option<u32>) -> Self {
        Self {
            first_id: None,
            last_id: None,
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub is_complete: bool,
    pub page: Page,
}

impl QueryResult {
    pub fn new(is_complete: bool, page: Page) -> Self {
        Self { is_complete, page }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub address: BareAddress,
}
