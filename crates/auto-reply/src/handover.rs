//! Handing a conversation over to a human operator.

use std::sync::Arc;

use {
    switchboard_channels::TransportSession,
    switchboard_common::{
        phone::{normalize_phone, to_jid},
        types::{ConversationMode, Device},
    },
    switchboard_config::HandoverConfig,
    switchboard_store::Store,
    tracing::{info, warn},
};

use crate::Result;

const SNIPPET_CHARS: usize = 120;

/// What a handover managed to do. Only the mode flip is mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoverReport {
    pub user_notified: bool,
    pub mode_changed: bool,
    /// `None` when the device has no admin number.
    pub admin_notified: Option<bool>,
}

pub struct HandoverCoordinator {
    store: Arc<dyn Store>,
    user_notice: String,
    admin_template: String,
    country_code: String,
}

impl HandoverCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        config: &HandoverConfig,
        country_code: impl Into<String>,
    ) -> Self {
        Self {
            store,
            user_notice: config.user_notice.clone(),
            admin_template: config.admin_template.clone(),
            country_code: country_code.into(),
        }
    }

    /// Notify the user, switch the conversation to agent mode and alert the
    /// device admin. Notification failures are logged; a failed mode flip is
    /// returned as an error.
    pub async fn hand_over(
        &self,
        session: &dyn TransportSession,
        device: &Device,
        wa_number: &str,
        reply_jid: &str,
        trigger: &str,
    ) -> Result<HandoverReport> {
        let mut report = HandoverReport::default();

        match session.send_text(reply_jid, &self.user_notice).await {
            Ok(()) => report.user_notified = true,
            Err(e) => warn!(
                device_id = %device.id,
                conversation = wa_number,
                error = %e,
                "handover notice not delivered"
            ),
        }

        report.mode_changed = self
            .store
            .set_conversation_mode(wa_number, ConversationMode::Agent)
            .await?;
        info!(device_id = %device.id, conversation = wa_number, "conversation handed over");

        #[cfg(feature = "metrics")]
        switchboard_metrics::counter!(switchboard_metrics::reply::HANDOVERS_TOTAL).increment(1);

        if let Some(admin) = device.admin_number.as_deref().filter(|a| !a.trim().is_empty()) {
            let admin_jid = if admin.contains('@') {
                admin.to_string()
            } else {
                to_jid(&normalize_phone(admin, &self.country_code))
            };
            let alert = self.admin_alert(device, wa_number, trigger);
            let delivered = match session.send_text(&admin_jid, &alert).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "admin alert not delivered");
                    false
                },
            };
            report.admin_notified = Some(delivered);
        }

        Ok(report)
    }

    fn admin_alert(&self, device: &Device, wa_number: &str, trigger: &str) -> String {
        let mut snippet: String = trigger.chars().take(SNIPPET_CHARS).collect();
        if trigger.chars().count() > SNIPPET_CHARS {
            snippet.push('…');
        }
        self.admin_template
            .replace("{user}", wa_number)
            .replace("{device}", &device.name)
            .replace("{message}", &snippet)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        switchboard_channels::{ConnectRequest, LoginMode, LoopbackTransport, Transport},
        switchboard_store::InMemoryStore,
    };

    async fn session(transport: &LoopbackTransport) -> Arc<dyn TransportSession> {
        transport
            .connect(ConnectRequest {
                device_id: "dev-1".into(),
                credentials: None,
                mode: LoginMode::Qr,
            })
            .await
            .unwrap()
            .session
    }

    fn device(admin: Option<&str>) -> Device {
        Device {
            id: "dev-1".into(),
            name: "Toko Maju".into(),
            phone_number: "628111".into(),
            admin_number: admin.map(Into::into),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn notifies_user_and_admin_and_flips_mode() {
        let store = Arc::new(InMemoryStore::new());
        store.touch_conversation("628123", "dev-1", Some("Budi"), 1).await.unwrap();
        let transport = LoopbackTransport::new();
        let session = session(&transport).await;
        let coordinator = HandoverCoordinator::new(store.clone(), &HandoverConfig::default(), "62");

        let report = coordinator
            .hand_over(
                session.as_ref(),
                &device(Some("0812-999")),
                "628123",
                "628123@s.whatsapp.net",
                "refund?",
            )
            .await
            .unwrap();
        assert_eq!(report, HandoverReport {
            user_notified: true,
            mode_changed: true,
            admin_notified: Some(true),
        });

        let conv = store.get_conversation("628123").await.unwrap().unwrap();
        assert_eq!(conv.mode, ConversationMode::Agent);

        let sent = transport.session("dev-1").unwrap().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, "628123@s.whatsapp.net");
        assert_eq!(sent[0].text, HandoverConfig::default().user_notice);
        assert_eq!(sent[1].to, "62812999@s.whatsapp.net");
        assert!(sent[1].text.contains("wa.me/628123"));
        assert!(sent[1].text.contains("Toko Maju"));
        assert!(sent[1].text.contains("refund?"));
    }

    #[tokio::test]
    async fn failed_notices_do_not_undo_mode_flip() {
        let store = Arc::new(InMemoryStore::new());
        store.touch_conversation("628123", "dev-1", None, 1).await.unwrap();
        let transport = LoopbackTransport::new();
        let session = session(&transport).await;
        transport.session("dev-1").unwrap().set_fail_sends(true);
        let coordinator = HandoverCoordinator::new(store.clone(), &HandoverConfig::default(), "62");

        let report = coordinator
            .hand_over(
                session.as_ref(),
                &device(Some("62812999")),
                "628123",
                "628123@s.whatsapp.net",
                "hi",
            )
            .await
            .unwrap();
        assert!(!report.user_notified);
        assert!(report.mode_changed);
        assert_eq!(report.admin_notified, Some(false));
        assert_eq!(
            store.get_conversation("628123").await.unwrap().unwrap().mode,
            ConversationMode::Agent
        );
    }
}
