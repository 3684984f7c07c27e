//! The inbound pipeline for one message at a time.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use {
    switchboard_channels::{InboundEvent, Presence, TransportSession},
    switchboard_common::{
        now_ms,
        types::{ConversationMode, Device, MessageStatus, NewMessage},
    },
    switchboard_store::{AI_ENABLED_SETTING, Store},
    tracing::{debug, info, warn},
};

use crate::{
    engine::{NoAnswerReason, ReplyEngine, ReplyOutcome},
    filter::{DropReason, InboundMessage, accept},
    handover::HandoverCoordinator,
};

/// Message ids remembered per device for redelivery detection.
const DEDUP_WINDOW: usize = 512;

/// What the pipeline did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Dropped(DropReason),
    Duplicate,
    /// Persisted only; a human owns the conversation.
    AgentMode,
    /// Persisted only; auto-reply is switched off globally.
    AiDisabled,
    Replied { delivered: bool },
    HandedOver(NoAnswerReason),
    /// The engine declined and the handover itself failed.
    HandoverFailed(NoAnswerReason),
}

#[derive(Default)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= DEDUP_WINDOW
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

pub struct InboundPipeline {
    store: Arc<dyn Store>,
    engine: ReplyEngine,
    handover: HandoverCoordinator,
    presence_updates: bool,
    seen: Mutex<HashMap<String, SeenIds>>,
}

impl InboundPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        engine: ReplyEngine,
        handover: HandoverCoordinator,
        presence_updates: bool,
    ) -> Self {
        Self {
            store,
            engine,
            handover,
            presence_updates,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Process one transport event for `device`. Store and transport failures
    /// are logged, never returned: the worker loop must keep going.
    pub async fn handle(
        &self,
        device: &Device,
        session: &dyn TransportSession,
        event: InboundEvent,
    ) -> PipelineOutcome {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        #[cfg(feature = "metrics")]
        switchboard_metrics::counter!(switchboard_metrics::inbound::EVENTS_TOTAL).increment(1);

        let outcome = match accept(&device.id, event) {
            Ok(msg) => self.process(device, session, msg).await,
            Err(reason) => {
                debug!(device_id = %device.id, reason = reason.as_str(), "inbound event dropped");
                PipelineOutcome::Dropped(reason)
            },
        };

        #[cfg(feature = "metrics")]
        {
            use switchboard_metrics::{counter, histogram, inbound, labels};
            match &outcome {
                PipelineOutcome::Dropped(reason) => {
                    counter!(inbound::DROPPED_TOTAL, labels::REASON => reason.as_str()).increment(1)
                },
                PipelineOutcome::Duplicate => {
                    counter!(inbound::DROPPED_TOTAL, labels::REASON => "duplicate").increment(1)
                },
                _ => {
                    counter!(inbound::PROCESSED_TOTAL).increment(1);
                    histogram!(inbound::PROCESSING_DURATION_SECONDS)
                        .record(started.elapsed().as_secs_f64());
                },
            }
        }

        outcome
    }

    fn first_sighting(&self, device_id: &str, message_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.to_string())
            .or_default()
            .insert(message_id)
    }

    async fn process(
        &self,
        device: &Device,
        session: &dyn TransportSession,
        msg: InboundMessage,
    ) -> PipelineOutcome {
        if let Some(id) = msg.message_id.as_deref()
            && !self.first_sighting(&device.id, id)
        {
            debug!(device_id = %device.id, message_id = id, "duplicate inbound message");
            return PipelineOutcome::Duplicate;
        }
        info!(device_id = %device.id, conversation = %msg.wa_number, "inbound message");

        if let Err(e) = self
            .store
            .insert_message(NewMessage::inbound(&msg.wa_number, &msg.text))
            .await
        {
            warn!(
                device_id = %device.id,
                conversation = %msg.wa_number,
                error = %e,
                "failed to persist inbound message"
            );
        }

        let name = msg.name.as_deref().unwrap_or(&msg.wa_number);
        let mode = match self
            .store
            .touch_conversation(&msg.wa_number, &device.id, Some(name), now_ms())
            .await
        {
            Ok(conversation) => conversation.mode,
            Err(e) => {
                warn!(
                    device_id = %device.id,
                    conversation = %msg.wa_number,
                    error = %e,
                    "failed to upsert conversation"
                );
                ConversationMode::Bot
            },
        };
        if mode == ConversationMode::Agent {
            debug!(conversation = %msg.wa_number, "conversation handled by an agent");
            return PipelineOutcome::AgentMode;
        }
        if !self.ai_enabled().await {
            debug!(conversation = %msg.wa_number, "auto-reply disabled");
            return PipelineOutcome::AiDisabled;
        }

        self.presence(session, &msg.reply_jid, Presence::Composing).await;
        let outcome = match self.engine.answer(&device.id, &msg.text).await {
            ReplyOutcome::Answer(answer) => self.reply(device, session, &msg, &answer).await,
            ReplyOutcome::NoAnswer(reason) => {
                info!(
                    device_id = %device.id,
                    conversation = %msg.wa_number,
                    reason = reason.as_str(),
                    "no answer, handing over"
                );
                match self
                    .handover
                    .hand_over(session, device, &msg.wa_number, &msg.reply_jid, &msg.text)
                    .await
                {
                    Ok(_) => PipelineOutcome::HandedOver(reason),
                    Err(e) => {
                        warn!(
                            device_id = %device.id,
                            conversation = %msg.wa_number,
                            error = %e,
                            "handover failed"
                        );
                        PipelineOutcome::HandoverFailed(reason)
                    },
                }
            },
        };
        self.presence(session, &msg.reply_jid, Presence::Available).await;
        outcome
    }

    async fn reply(
        &self,
        device: &Device,
        session: &dyn TransportSession,
        msg: &InboundMessage,
        answer: &str,
    ) -> PipelineOutcome {
        let delivered = match session.send_text(&msg.reply_jid, answer).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    device_id = %device.id,
                    conversation = %msg.wa_number,
                    error = %e,
                    "reply not delivered"
                );
                false
            },
        };
        let status = if delivered {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };
        if let Err(e) = self
            .store
            .insert_message(NewMessage::outbound(&msg.wa_number, answer, status))
            .await
        {
            warn!(conversation = %msg.wa_number, error = %e, "failed to persist reply");
        }
        PipelineOutcome::Replied { delivered }
    }

    /// Missing or unreadable settings leave auto-reply on.
    async fn ai_enabled(&self) -> bool {
        match self.store.get_setting(AI_ENABLED_SETTING).await {
            Ok(Some(value)) => value.as_bool().unwrap_or(true),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "failed to read ai_enabled setting");
                true
            },
        }
    }

    async fn presence(&self, session: &dyn TransportSession, jid: &str, presence: Presence) {
        if !self.presence_updates {
            return;
        }
        if let Err(e) = session.send_presence(jid, presence).await {
            debug!(error = %e, presence = presence.as_str(), "presence update failed");
        }
    }
}
