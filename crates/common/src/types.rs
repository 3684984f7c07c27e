//! Records shared by the store, the inbound pipeline and the gateway.
//!
//! Timestamps are Unix milliseconds (see [`crate::now_ms`]).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// A tenant phone line managed by one transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    /// Receives handover alerts when set.
    #[serde(default)]
    pub admin_number: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

/// Who is answering a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    #[default]
    Bot,
    Agent,
}

impl ConversationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Agent => "agent",
        }
    }
}

impl FromStr for ConversationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "agent" => Ok(Self::Agent),
            other => Err(Error::parse("conversation mode", other)),
        }
    }
}

/// A chat with one end user, keyed by their bare phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub wa_number: String,
    pub device_id: String,
    pub name: Option<String>,
    pub mode: ConversationMode,
    pub last_active: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(Error::parse("message direction", other)),
        }
    }
}

/// Delivery status of a message.
///
/// `Pending` is the only non-terminal status. Terminal statuses only move
/// forward along `sent → delivered → read`; `failed` never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Statuses a message may be in for an update to `self` to apply.
    pub fn predecessors(self) -> &'static [MessageStatus] {
        match self {
            Self::Pending => &[],
            Self::Sent | Self::Failed => &[Self::Pending],
            Self::Delivered => &[Self::Pending, Self::Sent],
            Self::Read => &[Self::Pending, Self::Sent, Self::Delivered],
        }
    }

    pub fn can_become(self, next: MessageStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(Error::parse("message status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    #[serde(rename = "message")]
    pub text: String,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub created_at: i64,
}

impl Message {
    /// Operator-authored and not yet dispatched.
    pub fn is_pending_outbound(&self) -> bool {
        self.direction == MessageDirection::Outbound && self.status == MessageStatus::Pending
    }
}

/// Insert payload for [`Message`]; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub text: String,
    pub direction: MessageDirection,
    pub status: MessageStatus,
}

impl NewMessage {
    pub fn inbound(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            direction: MessageDirection::Inbound,
            status: MessageStatus::Read,
        }
    }

    pub fn outbound(
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            direction: MessageDirection::Outbound,
            status,
        }
    }
}

/// A retrieved knowledge chunk with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeMatch {
    pub id: i64,
    pub content: String,
    pub similarity: f32,
}

/// Connection status as mirrored to the `system_status` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Initializing,
    QrReady,
    PairingReady,
    Connected,
    Disconnected,
    LoggedOut,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::QrReady => "qr_ready",
            Self::PairingReady => "pairing_ready",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "qr_ready" => Ok(Self::QrReady),
            "pairing_ready" => Ok(Self::PairingReady),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "logged_out" => Ok(Self::LoggedOut),
            other => Err(Error::parse("connection status", other)),
        }
    }
}

/// One row of `system_status`, keyed by device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: String,
    pub status: ConnectionStatus,
    pub qr_code: Option<String>,
    pub updated_at: i64,
}
