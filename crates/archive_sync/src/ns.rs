//! Namespaces of the extensions the transformation pipeline understands.

pub const CLIENT: &str = "jabber:client";
pub const OOB: &str = "jabber:x:oob";
pub const CORRECT: &str = "urn:xmpp:message-correct:0";
pub const RETRACT: &str = "urn:xmpp:message-retract:1";
pub const REACTIONS: &str = "urn:xmpp:reactions:0";
pub const REPLY: &str = "urn:xmpp:reply:0";
pub const MARKERS: &str = "urn:xmpp:chat-markers:0";
pub const RECEIPTS: &str = "urn:xmpp:receipts";
pub const FALLBACK: &str = "urn:xmpp:fallback:0";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const OCCUPANT_ID: &str = "urn:xmpp:occupant-id:0";
