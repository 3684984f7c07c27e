use {
    serde::{Deserialize, Serialize},
    switchboard_channels::{
        CloseReason, Credentials, InboundEvent, InboundKind, TransportEvent,
    },
};

/// Messages sent from the gateway to the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Open (or reopen) the socket for an account.
    Login {
        account_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<Credentials>,
        /// When set, request a pairing code for this number instead of QR.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_phone: Option<String>,
    },
    SendText {
        request_id: String,
        account_id: String,
        to: String,
        text: String,
    },
    Presence {
        account_id: String,
        to: String,
        presence: String,
    },
    /// Unlink the account and close its socket.
    Logout { account_id: String },
    /// Close the socket but keep the account linked.
    Close { account_id: String },
}

/// Messages received from the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Qr {
        account_id: String,
        qr: String,
    },
    PairingCode {
        account_id: String,
        code: String,
    },
    Connected {
        account_id: String,
        #[serde(default)]
        phone_number: Option<String>,
    },
    Disconnected {
        account_id: String,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    LoggedOut {
        account_id: String,
    },
    CredsUpdate {
        account_id: String,
        creds: Credentials,
    },
    InboundMessage {
        account_id: String,
        #[serde(default)]
        message_id: Option<String>,
        chat_jid: String,
        #[serde(default)]
        sender_jid: Option<String>,
        #[serde(default)]
        push_name: Option<String>,
        #[serde(default)]
        from_me: bool,
        /// Content key of the WhatsApp message (`conversation`, `imageMessage`, ...).
        message_type: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        account_id: Option<String>,
        error: String,
    },
}

impl SidecarMessage {
    /// Split an account-scoped message into its account id and transport event.
    ///
    /// `send_result` and `error` are not session events and return `None`.
    pub fn into_event(self) -> Option<(String, TransportEvent)> {
        let routed = match self {
            Self::Qr { account_id, qr } => (account_id, TransportEvent::Qr(qr)),
            Self::PairingCode { account_id, code } => {
                (account_id, TransportEvent::PairingCode(code))
            },
            Self::Connected {
                account_id,
                phone_number,
            } => (account_id, TransportEvent::Open { phone_number }),
            Self::Disconnected {
                account_id,
                status_code,
                reason,
            } => (
                account_id,
                TransportEvent::Close(close_reason_from_status(status_code, reason)),
            ),
            Self::LoggedOut { account_id } => {
                (account_id, TransportEvent::Close(CloseReason::LoggedOut))
            },
            Self::CredsUpdate { account_id, creds } => {
                (account_id, TransportEvent::CredentialsUpdated(creds))
            },
            Self::InboundMessage {
                account_id,
                message_id,
                chat_jid,
                sender_jid,
                push_name,
                from_me,
                message_type,
                text,
                timestamp,
            } => (
                account_id,
                TransportEvent::Inbound(InboundEvent {
                    message_id,
                    kind: InboundKind::from_content_key(&message_type),
                    chat_jid,
                    sender_jid,
                    push_name,
                    from_me,
                    text,
                    timestamp,
                }),
            ),
            Self::SendResult { .. } | Self::Error { .. } => return None,
        };
        Some(routed)
    }
}

/// Map a Baileys `DisconnectReason` status code to a [`CloseReason`].
pub fn close_reason_from_status(status_code: Option<u16>, reason: Option<String>) -> CloseReason {
    let message = reason.unwrap_or_default();
    match status_code {
        Some(401) => CloseReason::LoggedOut,
        Some(408) => CloseReason::TimedOut,
        Some(428) => CloseReason::ConnectionLost(if message.is_empty() {
            "connection closed".into()
        } else {
            message
        }),
        Some(440) => CloseReason::ConnectionReplaced,
        Some(515) => CloseReason::RestartRequired,
        code => CloseReason::Other { code, message },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[rstest]
    #[case(Some(401), CloseReason::LoggedOut)]
    #[case(Some(408), CloseReason::TimedOut)]
    #[case(Some(440), CloseReason::ConnectionReplaced)]
    #[case(Some(515), CloseReason::RestartRequired)]
    #[case(Some(500), CloseReason::Other { code: Some(500), message: String::new() })]
    #[case(None, CloseReason::Other { code: None, message: String::new() })]
    fn maps_baileys_status_codes(#[case] code: Option<u16>, #[case] expected: CloseReason) {
        assert_eq!(close_reason_from_status(code, None), expected);
    }

    #[test]
    fn login_serializes_with_type_tag() {
        let msg = GatewayMessage::Login {
            account_id: "d1".into(),
            credentials: None,
            pairing_phone: Some("62811".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "login", "account_id": "d1", "pairing_phone": "62811"})
        );
    }

    #[test]
    fn inbound_message_becomes_transport_event() {
        let raw = json!({
            "type": "inbound_message",
            "account_id": "d1",
            "message_id": "3EB0ABC",
            "chat_jid": "628222@s.whatsapp.net",
            "push_name": "Budi",
            "message_type": "extendedTextMessage",
            "text": "jam buka?"
        });
        let msg: SidecarMessage = serde_json::from_value(raw).unwrap();
        let (account, event) = msg.into_event().unwrap();
        assert_eq!(account, "d1");
        match event {
            TransportEvent::Inbound(ev) => {
                assert_eq!(ev.kind, InboundKind::ExtendedText);
                assert_eq!(ev.text.as_deref(), Some("jam buka?"));
                assert!(!ev.from_me);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_and_send_result() {
        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "disconnected", "account_id": "d1", "status_code": 401
        }))
        .unwrap();
        assert_eq!(
            msg.into_event(),
            Some(("d1".to_string(), TransportEvent::Close(CloseReason::LoggedOut)))
        );

        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "send_result", "request_id": "r1", "success": true
        }))
        .unwrap();
        assert!(msg.into_event().is_none());
    }
}
