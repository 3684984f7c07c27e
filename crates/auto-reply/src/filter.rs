//! Which transport events count as real messages.

use {
    switchboard_channels::{InboundEvent, InboundKind},
    switchboard_common::phone::{is_broadcast_jid, is_group_jid, jid_user},
};

/// Payload kinds the pipeline processes. Anything else is dropped.
const ALLOWED_KINDS: &[InboundKind] = &[InboundKind::Conversation, InboundKind::ExtendedText];

/// A text message from an end user, ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub device_id: String,
    /// Bare number of the sender; the conversation key.
    pub wa_number: String,
    /// Chat to answer in.
    pub reply_jid: String,
    pub name: Option<String>,
    pub text: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    FromMe,
    Group,
    Broadcast,
    Kind(InboundKind),
    Empty,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromMe => "from_me",
            Self::Group => "group",
            Self::Broadcast => "broadcast",
            Self::Kind(_) => "kind",
            Self::Empty => "empty",
        }
    }
}

/// Apply the allow-list to a raw event.
pub fn accept(device_id: &str, event: InboundEvent) -> Result<InboundMessage, DropReason> {
    if event.from_me {
        return Err(DropReason::FromMe);
    }
    if is_group_jid(&event.chat_jid) {
        return Err(DropReason::Group);
    }
    if is_broadcast_jid(&event.chat_jid) {
        return Err(DropReason::Broadcast);
    }
    if !ALLOWED_KINDS.contains(&event.kind) {
        return Err(DropReason::Kind(event.kind));
    }
    let text = event
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(DropReason::Empty)?
        .to_string();
    let wa_number = jid_user(&event.chat_jid).to_string();
    if wa_number.is_empty() {
        return Err(DropReason::Empty);
    }

    Ok(InboundMessage {
        device_id: device_id.to_string(),
        wa_number,
        reply_jid: event.chat_jid,
        name: event.push_name.filter(|n| !n.trim().is_empty()),
        text,
        message_id: event.message_id,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    const USER: &str = "628123@s.whatsapp.net";

    fn event(kind: InboundKind, chat: &str, text: Option<&str>) -> InboundEvent {
        InboundEvent {
            message_id: Some("ABC".into()),
            kind,
            chat_jid: chat.into(),
            sender_jid: None,
            push_name: Some("Budi".into()),
            from_me: false,
            text: text.map(Into::into),
            timestamp: None,
        }
    }

    #[test]
    fn accepts_plain_text() {
        let msg = accept(
            "dev-1",
            event(InboundKind::Conversation, "628123@s.whatsapp.net", Some(" halo ")),
        )
        .unwrap();
        assert_eq!(msg.wa_number, "628123");
        assert_eq!(msg.reply_jid, "628123@s.whatsapp.net");
        assert_eq!(msg.text, "halo");
        assert_eq!(msg.name.as_deref(), Some("Budi"));
        assert_eq!(msg.message_id.as_deref(), Some("ABC"));
    }

    #[rstest]
    #[case(InboundKind::Image, USER, Some("caption"), DropReason::Kind(InboundKind::Image))]
    #[case(InboundKind::Reaction, USER, Some("👍"), DropReason::Kind(InboundKind::Reaction))]
    #[case(InboundKind::Protocol, USER, None, DropReason::Kind(InboundKind::Protocol))]
    #[case(InboundKind::Conversation, "1203630@g.us", Some("hi all"), DropReason::Group)]
    #[case(InboundKind::Conversation, "status@broadcast", Some("story"), DropReason::Broadcast)]
    #[case(InboundKind::ExtendedText, USER, Some("   "), DropReason::Empty)]
    fn drops_non_messages(
        #[case] kind: InboundKind,
        #[case] chat: &str,
        #[case] text: Option<&str>,
        #[case] reason: DropReason,
    ) {
        assert_eq!(accept("dev-1", event(kind, chat, text)), Err(reason));
    }

    #[test]
    fn drops_self_sent() {
        let mut ev = event(InboundKind::Conversation, "628123@s.whatsapp.net", Some("hi"));
        ev.from_me = true;
        assert_eq!(accept("dev-1", ev), Err(DropReason::FromMe));
    }
}
