//! Message, conversation and membership types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from anything string-like.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Address of a one-to-one or group conversation.
    ConversationId
);
string_id!(
    /// Identifier of an individual sender inside a group.
    ParticipantId
);
string_id!(
    /// Identifier the platform assigned to a message.
    MessageId
);

/// Content type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Contact,
    Location,
    Reaction,
    Other,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Reaction => "reaction",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub conversation: ConversationId,
    /// Sender inside a group; `None` in one-to-one conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ParticipantId>,
    /// Sent by the account this session is logged in as.
    #[serde(default)]
    pub from_self: bool,
    pub kind: MessageKind,
    /// Body for text messages, caption for media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unix epoch seconds.
    pub timestamp: i64,
    /// Native payload as the transport received it.
    #[serde(default)]
    pub raw: Value,
}

impl InboundMessage {
    /// Build a plain text message.
    #[must_use]
    pub fn text(
        id: impl Into<MessageId>,
        conversation: impl Into<ConversationId>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation: conversation.into(),
            sender: None,
            from_self: false,
            kind: MessageKind::Text,
            text: Some(body.into()),
            timestamp: 0,
            raw: Value::Null,
        }
    }

    /// Build a message of another kind, without text.
    #[must_use]
    pub fn of_kind(
        id: impl Into<MessageId>,
        conversation: impl Into<ConversationId>,
        kind: MessageKind,
    ) -> Self {
        Self {
            kind,
            text: None,
            ..Self::text(id, conversation, String::new())
        }
    }

    /// Set the group sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<ParticipantId>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Mark as sent by this account.
    #[must_use]
    pub fn with_from_self(mut self, from_self: bool) -> Self {
        self.from_self = from_self;
        self
    }

    /// Whether this is a text message carrying a body.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text && self.text.is_some()
    }

    /// Text body of a text message.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        if self.kind == MessageKind::Text {
            self.text.as_deref()
        } else {
            None
        }
    }
}

/// An edit or deletion of an earlier message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: MessageId,
    pub conversation: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Outbound message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Plain text.
    Text { text: String },
    /// Media fetched by the transport from a URL.
    Media {
        kind: MessageKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Emoji reaction to an existing message.
    Reaction { target: MessageId, emoji: String },
}

impl Payload {
    /// Create a text payload.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Kind of message this payload produces.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Media { kind, .. } => *kind,
            Self::Reaction { .. } => MessageKind::Reaction,
        }
    }
}

/// Per-send options understood by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Message to quote in the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted: Option<MessageId>,
    /// Participants to mention.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<ParticipantId>,
}

impl SendOptions {
    /// Quote an earlier message.
    #[must_use]
    pub fn quoting(mut self, id: impl Into<MessageId>) -> Self {
        self.quoted = Some(id.into());
        self
    }

    /// Mention a participant.
    #[must_use]
    pub fn mention(mut self, participant: impl Into<ParticipantId>) -> Self {
        self.mentions.push(participant.into());
        self
    }
}

/// Returned by the transport for a message it accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDescriptor {
    pub id: MessageId,
    pub conversation: ConversationId,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

/// Role of a group participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    #[default]
    Member,
    Admin,
    SuperAdmin,
}

/// A participant as listed in group metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: ParticipantId,
    #[serde(default)]
    pub role: ParticipantRole,
}

/// Metadata of a group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: ConversationId,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ParticipantId>,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
    /// Unix epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl GroupMetadata {
    /// Whether `participant` is listed in this group.
    #[must_use]
    pub fn has_participant(&self, participant: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == participant)
    }
}

/// What happened to the participants of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Participants joined, left or changed role in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub conversation: ConversationId,
    pub participants: Vec<ParticipantId>,
    pub action: MembershipAction,
}
