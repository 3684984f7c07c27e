//! Gateway-style inbound webhook.
//!
//! Accepts Fonnte-compatible payloads for numbers that are served by an
//! external HTTP gateway instead of a linked session, and records the message
//! the same way the inbound pipeline would, without replying.

use {
    serde::Serialize,
    serde_json::Value,
    switchboard_common::{
        now_ms,
        phone::normalize_phone,
        types::{Device, MessageDirection, MessageStatus, NewMessage},
    },
    switchboard_store::Store,
    tracing::{debug, info},
};

use crate::Result;

/// Fields of interest, with the Indonesian aliases some gateways send.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WebhookPayload {
    pub sender: Option<String>,
    pub target: Option<String>,
    pub message: Option<String>,
    pub name: Option<String>,
    pub device: Option<String>,
    pub from_me: bool,
}

impl WebhookPayload {
    pub fn from_json(body: &Value) -> Self {
        let field = |keys: &[&str]| keys.iter().find_map(|k| text_field(body.get(*k)?));
        Self {
            sender: field(&["sender", "pengirim"]),
            target: field(&["target", "penerima"]),
            message: field(&["message", "pesan", "text"]),
            name: field(&["name"]),
            device: field(&["device"]),
            from_me: ["me", "fromMe"]
                .iter()
                .any(|k| body.get(*k).and_then(Value::as_bool) == Some(true)),
        }
    }
}

/// Gateways send phone numbers either as strings or as JSON numbers.
fn text_field(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Ok,
    Ignored { reason: &'static str },
}

/// Record one webhook message.
pub async fn ingest(
    store: &dyn Store,
    country_code: &str,
    payload: WebhookPayload,
) -> Result<WebhookOutcome> {
    let (Some(sender_raw), Some(text)) = (payload.sender, payload.message) else {
        debug!("webhook ignored: missing sender or message");
        return Ok(WebhookOutcome::Ignored {
            reason: "missing_fields",
        });
    };
    let sender = normalize_phone(&sender_raw, country_code);
    let device_phone = payload
        .device
        .as_deref()
        .map(|d| normalize_phone(d, country_code))
        .unwrap_or_default();
    let target = payload
        .target
        .as_deref()
        .map(|t| normalize_phone(t, country_code))
        .unwrap_or_default();

    let Some(device) = find_device(store, &device_phone, country_code).await? else {
        info!(device = %device_phone, "webhook ignored: unknown device");
        return Ok(WebhookOutcome::Ignored {
            reason: "unknown_device",
        });
    };

    let outbound = payload.from_me || sender == device_phone;
    let (wa_number, direction) = if outbound {
        let peer = if target.is_empty() { sender.clone() } else { target };
        (peer, MessageDirection::Outbound)
    } else {
        (sender.clone(), MessageDirection::Inbound)
    };

    // Outbound payloads carry the gateway's own name; keep the contact's.
    let name = match direction {
        MessageDirection::Inbound => Some(payload.name.unwrap_or_else(|| sender.clone())),
        MessageDirection::Outbound => None,
    };
    store
        .touch_conversation(&wa_number, &device.id, name.as_deref(), now_ms())
        .await?;

    let message = match direction {
        MessageDirection::Inbound => NewMessage::inbound(&wa_number, text),
        MessageDirection::Outbound => NewMessage::outbound(&wa_number, text, MessageStatus::Sent),
    };
    let stored = store.insert_message(message).await?;
    info!(
        device_id = %device.id,
        conversation = %wa_number,
        direction = direction.as_str(),
        message_id = stored.id,
        "webhook message recorded"
    );
    Ok(WebhookOutcome::Ok)
}

async fn find_device(store: &dyn Store, phone: &str, country_code: &str) -> Result<Option<Device>> {
    if phone.is_empty() {
        return Ok(None);
    }
    if let Some(device) = store.find_device_by_phone(phone).await? {
        return Ok(Some(device));
    }
    // Rows written by hand may hold the number in local format.
    Ok(store
        .list_devices()
        .await?
        .into_iter()
        .find(|d| normalize_phone(&d.phone_number, country_code) == phone))
}
