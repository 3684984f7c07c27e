use std::{fmt, sync::Arc};

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{Result, credentials::Credentials};

/// How a fresh session authenticates when it has no usable credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    /// Emit QR codes for scanning from the phone.
    Qr,
    /// Emit a short code to be typed on the phone registered to `phone_number`.
    PairingCode { phone_number: String },
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was unlinked. Credentials are no longer valid.
    LoggedOut,
    ConnectionLost(String),
    /// Another client took over the same credentials.
    ConnectionReplaced,
    RestartRequired,
    TimedOut,
    Other { code: Option<u16>, message: String },
}

impl CloseReason {
    /// Terminal reasons must not be retried without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionLost(detail) => write!(f, "connection lost: {detail}"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Other {
                code: Some(code),
                message,
            } => write!(f, "closed ({code}): {message}"),
            Self::Other {
                code: None,
                message,
            } => write!(f, "closed: {message}"),
        }
    }
}

/// Chat presence shown to the other party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Available,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Composing => "composing",
            Self::Available => "available",
        }
    }
}

/// Payload type of an inbound protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Plain text.
    Conversation,
    /// Text with link preview, quote or mentions.
    ExtendedText,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Reaction,
    /// Revokes, edits, history sync and other housekeeping.
    Protocol,
    Other,
}

impl InboundKind {
    /// Map a WhatsApp message content key (`extendedTextMessage`, ...).
    pub fn from_content_key(key: &str) -> Self {
        match key {
            "conversation" => Self::Conversation,
            "extendedTextMessage" => Self::ExtendedText,
            "imageMessage" => Self::Image,
            "videoMessage" => Self::Video,
            "audioMessage" => Self::Audio,
            "documentMessage" | "documentWithCaptionMessage" => Self::Document,
            "stickerMessage" => Self::Sticker,
            "reactionMessage" => Self::Reaction,
            "protocolMessage" | "senderKeyDistributionMessage" => Self::Protocol,
            _ => Self::Other,
        }
    }
}

/// A message event as reported by the transport, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Transport message id, stable across redelivery.
    pub message_id: Option<String>,
    pub kind: InboundKind,
    pub chat_jid: String,
    /// Participant JID in groups; usually absent in 1:1 chats.
    pub sender_jid: Option<String>,
    pub push_name: Option<String>,
    pub from_me: bool,
    pub text: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Qr(String),
    PairingCode(String),
    Open { phone_number: Option<String> },
    Close(CloseReason),
    CredentialsUpdated(Credentials),
    Inbound(InboundEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub device_id: String,
    /// Previously saved credentials; `None` starts an unauthenticated login.
    pub credentials: Option<Credentials>,
    pub mode: LoginMode,
}

/// A freshly opened session and the stream of its events.
///
/// The event stream ends when the session is gone; the consumer treats an
/// end without a [`TransportEvent::Close`] as a lost connection.
pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection>;
}

/// Operations on one live session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send a text message to a JID.
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<()>;

    /// Unlink the account on the server side, then close.
    async fn logout(&self) -> Result<()>;

    /// Close the connection, keeping the account linked.
    async fn close(&self) -> Result<()>;
}
