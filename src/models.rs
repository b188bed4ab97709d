use chrono::{DateTime, Utc};
use std::fmt;

/// A sender or recipient identity as it appears in a header.
///
/// Deduplicated on the exact `(address, display_name)` pair; a missing
/// display name is stored as the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub address: String,
    pub display_name: String,
}

impl Address {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
        }
    }
}

/// Role an address plays on an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    From,
    To,
    Cc,
    ReplyTo,
}

impl Role {
    /// Header the role is read from.
    pub fn header(self) -> &'static str {
        match self {
            Role::From => "From",
            Role::To => "To",
            Role::Cc => "Cc",
            Role::ReplyTo => "Reply-To",
        }
    }

    /// Tag stored on the envelope/subscriber association.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::From => "From",
            Role::To => "To",
            Role::Cc => "CC",
            Role::ReplyTo => "Replyto",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header-derived fields of an envelope row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeFields {
    /// `None` when the header is missing or empty; only present ids are unique.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub send_date: Option<DateTime<Utc>>,
    pub x_mailer: Option<String>,
    pub user_agent: Option<String>,
}

/// One imported email message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: i64,
    pub fields: EnvelopeFields,
    pub from_ids: Vec<i64>,
    pub to_ids: Vec<i64>,
    pub cc_ids: Vec<i64>,
    pub reply_to_ids: Vec<i64>,
    /// Imported because another message embeds it.
    pub referenced: bool,
}

impl Envelope {
    pub fn subscriber_ids(&self, role: Role) -> &[i64] {
        match role {
            Role::From => &self.from_ids,
            Role::To => &self.to_ids,
            Role::Cc => &self.cc_ids,
            Role::ReplyTo => &self.reply_to_ids,
        }
    }
}

/// Columns of a part row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartFields {
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub decoded_content: Option<String>,
    pub raw_content: Option<Vec<u8>>,
    /// Non-owning cross-reference to an embedded message's envelope.
    pub referenced_envelope_id: Option<i64>,
}

/// A node of the in-memory MIME tree of one message.
///
/// `id` and `parent_id` are assigned when the tree is persisted; the tree
/// itself owns its children only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartNode {
    pub id: Option<i64>,
    pub parent_id: Option<i64>,
    pub envelope_id: Option<i64>,
    pub fields: PartFields,
    pub children: Vec<PartNode>,
}

impl PartNode {
    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(PartNode::node_count).sum::<usize>()
    }
}
