//! Outbound dispatcher.
//!
//! Watches the store for operator-authored `pending` messages and delivers
//! them through the owning device's live session. Messages of one
//! conversation go through a single lane and are sent in insertion order;
//! different conversations are delivered concurrently. Each message ends in
//! `sent` or `failed`, never stays pending after an attempt.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    switchboard_channels::TransportSession,
    switchboard_common::{
        now_ms,
        phone::to_jid,
        types::{Conversation, Message, MessageStatus},
    },
    switchboard_store::{Store, StoreEvent},
    tokio::sync::{broadcast::error::RecvError, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::Result;

/// Resolves a device id to its connected session.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn session_for(&self, device_id: &str) -> Option<Arc<dyn TransportSession>>;
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub send_timeout: Duration,
    /// A lane with nothing to send for this long is torn down.
    pub lane_idle_timeout: Duration,
    /// Page size when sweeping pending messages.
    pub sweep_limit: usize,
    /// Tries per store read or status write before giving up on a message.
    pub store_attempts: u32,
    /// Base delay between store retries, multiplied by the attempt number.
    pub store_retry_delay: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            lane_idle_timeout: Duration::from_secs(60),
            sweep_limit: 500,
            store_attempts: 3,
            store_retry_delay: Duration::from_millis(500),
        }
    }
}

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed,
    /// No longer pending when its turn came.
    Skipped,
}

impl Delivery {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<i64>,
}

struct Inner {
    store: Arc<dyn Store>,
    sessions: Arc<dyn SessionDirectory>,
    settings: DispatcherSettings,
    lanes: Mutex<HashMap<String, Lane>>,
    /// Message ids waiting in some lane.
    queued: Mutex<HashSet<i64>>,
    next_lane: AtomicU64,
}

#[derive(Clone)]
pub struct OutboundDispatcher {
    inner: Arc<Inner>,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<dyn SessionDirectory>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                sessions,
                settings,
                lanes: Mutex::new(HashMap::new()),
                queued: Mutex::new(HashSet::new()),
                next_lane: AtomicU64::new(0),
            }),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Subscribe to the change feed, pick up messages left pending from
    /// before, then follow the feed until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut feed = self.inner.store.subscribe();
        self.sweep_logged().await;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = feed.recv() => event,
            };
            match event {
                Ok(StoreEvent::MessageInserted(message)) if message.is_pending_outbound() => {
                    self.enqueue(&message);
                },
                Ok(_) => {},
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "outbound dispatcher lagged behind the change feed, resyncing");
                    self.sweep_logged().await;
                },
                Err(RecvError::Closed) => break,
            }
        }
        info!("outbound dispatcher stopped");
    }

    /// Queue every pending outbound message, paging through the store by id.
    /// Returns how many were queued.
    pub async fn sweep(&self) -> Result<usize> {
        let limit = self.inner.settings.sweep_limit.max(1);
        let mut after_id = 0;
        let mut queued = 0;
        loop {
            let page = self.inner.store.pending_outbound(after_id, limit).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            queued += page.iter().filter(|m| self.enqueue(m)).count();
            if page.len() < limit {
                break;
            }
        }
        Ok(queued)
    }

    async fn sweep_logged(&self) {
        match self.sweep().await {
            Ok(0) => {},
            Ok(queued) => info!(queued, "queued pending outbound messages"),
            Err(e) => warn!(error = %e, "failed to sweep pending outbound messages"),
        }
    }

    /// Returns `false` when the message is already queued.
    fn enqueue(&self, message: &Message) -> bool {
        if !self.lock_queued().insert(message.id) {
            return false;
        }
        let mut lanes = self.lock_lanes();
        let sent = lanes
            .get(&message.conversation_id)
            .is_some_and(|lane| lane.tx.send(message.id).is_ok());
        if !sent {
            let id = self.inner.next_lane.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(message.id);
            lanes.insert(message.conversation_id.clone(), Lane { id, tx });
            debug!(conversation = %message.conversation_id, lane = id, "outbound lane opened");

            #[cfg(feature = "metrics")]
            switchboard_metrics::gauge!(switchboard_metrics::outbound::ACTIVE_LANES).increment(1.0);

            tokio::spawn(
                self.clone()
                    .run_lane(message.conversation_id.clone(), id, rx),
            );
        }
        true
    }

    async fn run_lane(
        self,
        conversation_id: String,
        lane_id: u64,
        mut rx: mpsc::UnboundedReceiver<i64>,
    ) {
        let idle = self.inner.settings.lane_idle_timeout;
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(message_id)) => self.deliver_queued(message_id).await,
                Ok(None) => break,
                Err(_) => {
                    {
                        let mut lanes = self.lock_lanes();
                        if lanes.get(&conversation_id).is_some_and(|l| l.id == lane_id) {
                            lanes.remove(&conversation_id);
                        }
                    }
                    // Nothing can be queued here any more; finish what was.
                    while let Ok(message_id) = rx.try_recv() {
                        self.deliver_queued(message_id).await;
                    }
                    break;
                },
            }
        }
        debug!(conversation = %conversation_id, lane = lane_id, "outbound lane closed");

        #[cfg(feature = "metrics")]
        switchboard_metrics::gauge!(switchboard_metrics::outbound::ACTIVE_LANES).decrement(1.0);
    }

    async fn deliver_queued(&self, message_id: i64) {
        match self.deliver(message_id).await {
            Ok(delivery) => {
                debug!(message_id, delivery = delivery.as_str(), "outbound message handled");
            },
            Err(e) => warn!(message_id, error = %e, "outbound delivery failed"),
        }
        self.lock_queued().remove(&message_id);
    }

    /// Send one message if it is still pending and record the result.
    ///
    /// Store reads are retried; a message that still cannot be loaded after
    /// the last attempt is marked `failed`.
    pub async fn deliver(&self, message_id: i64) -> Result<Delivery> {
        let mut attempt = 1;
        let loaded = loop {
            match self.load(message_id).await {
                Ok(loaded) => break loaded,
                Err(e) if attempt < self.inner.settings.store_attempts => {
                    warn!(
                        message_id,
                        attempt,
                        error = %e,
                        "failed to load outbound message, retrying"
                    );
                    tokio::time::sleep(self.inner.settings.store_retry_delay * attempt).await;
                    attempt += 1;
                },
                Err(e) => {
                    warn!(message_id, attempt, error = %e, "giving up on outbound message");
                    return self.finish(message_id, MessageStatus::Failed).await;
                },
            }
        };
        let Some((message, conversation)) = loaded else {
            return Ok(Delivery::Skipped);
        };

        let Some(conversation) = conversation else {
            warn!(
                message_id,
                conversation = %message.conversation_id,
                "outbound message has no conversation"
            );
            return self.finish(message_id, MessageStatus::Failed).await;
        };
        let Some(session) = self.inner.sessions.session_for(&conversation.device_id).await else {
            warn!(
                message_id,
                device_id = %conversation.device_id,
                "device not connected, outbound message failed"
            );
            return self.finish(message_id, MessageStatus::Failed).await;
        };

        let to = to_jid(&conversation.wa_number);
        let started = std::time::Instant::now();
        let send = session.send_text(&to, &message.text);
        let result = tokio::time::timeout(self.inner.settings.send_timeout, send).await;

        #[cfg(feature = "metrics")]
        switchboard_metrics::histogram!(switchboard_metrics::outbound::SEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => {
                info!(
                    message_id,
                    device_id = %conversation.device_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "outbound message sent"
                );
                let delivery = self.finish(message_id, MessageStatus::Sent).await?;
                let touched = self
                    .inner
                    .store
                    .touch_conversation(
                        &conversation.wa_number,
                        &conversation.device_id,
                        None,
                        now_ms(),
                    )
                    .await;
                if let Err(e) = touched {
                    warn!(message_id, error = %e, "failed to bump conversation activity");
                }
                Ok(delivery)
            },
            Ok(Err(e)) => {
                warn!(
                    message_id,
                    device_id = %conversation.device_id,
                    error = %e,
                    "outbound send failed"
                );
                self.finish(message_id, MessageStatus::Failed).await
            },
            Err(_) => {
                warn!(message_id, device_id = %conversation.device_id, "outbound send timed out");
                self.finish(message_id, MessageStatus::Failed).await
            },
        }
    }

    /// The message if it is still pending, with its conversation if any.
    async fn load(&self, message_id: i64) -> Result<Option<(Message, Option<Conversation>)>> {
        let store = &self.inner.store;
        let Some(message) = store.get_message(message_id).await? else {
            return Ok(None);
        };
        if !message.is_pending_outbound() {
            return Ok(None);
        }
        let conversation = store.get_conversation(&message.conversation_id).await?;
        Ok(Some((message, conversation)))
    }

    /// Record a terminal status, retrying store errors.
    async fn finish(&self, message_id: i64, status: MessageStatus) -> Result<Delivery> {
        let mut attempt = 1;
        let applied = loop {
            match self.inner.store.update_message_status(message_id, status).await {
                Ok(applied) => break applied,
                Err(e) if attempt < self.inner.settings.store_attempts => {
                    warn!(
                        message_id,
                        attempt,
                        error = %e,
                        "failed to record outbound status, retrying"
                    );
                    tokio::time::sleep(self.inner.settings.store_retry_delay * attempt).await;
                    attempt += 1;
                },
                Err(e) => return Err(e.into()),
            }
        };
        let delivery = match (applied, status) {
            (false, _) => Delivery::Skipped,
            (true, MessageStatus::Sent) => Delivery::Sent,
            (true, _) => Delivery::Failed,
        };

        #[cfg(feature = "metrics")]
        switchboard_metrics::counter!(
            switchboard_metrics::outbound::MESSAGES_TOTAL,
            switchboard_metrics::labels::OUTCOME => delivery.as_str()
        )
        .increment(1);

        Ok(delivery)
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lane>> {
        self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_queued(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.inner.queued.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conversations with an open lane.
    pub fn active_lanes(&self) -> usize {
        self.lock_lanes().len()
    }
}
