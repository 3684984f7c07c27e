//! Session supervisor.
//!
//! Keeps at most one live transport session per device. Each session is
//! driven by its own event loop task that consumes the transport's typed
//! events in order; inbound messages are handed to a per-session worker so a
//! slow reply never stalls connection handling. All mutations of a device's
//! slot happen under that device's lock, so devices never wait on each other.
//!
//! State changes are mirrored to the store's status table. Recoverable closes
//! schedule a reconnect after a [`Backoff`] delay; a logout is terminal until
//! the device is explicitly reset.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    serde::Serialize,
    switchboard_auto_reply::{InboundPipeline, PipelineOutcome},
    switchboard_channels::{
        CloseReason, ConnectRequest, CredentialStore, InboundEvent, LoginMode, Transport,
        TransportEvent, TransportSession,
    },
    switchboard_common::{
        now_ms,
        phone::normalize_phone,
        types::{ConnectionStatus, Device, StatusRecord},
    },
    switchboard_config::SwitchboardConfig,
    switchboard_store::Store,
    tokio::sync::{Mutex, mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result, backoff::Backoff, heartbeat::spawn_heartbeat, outbound::SessionDirectory,
};

const INBOUND_BUFFER: usize = 256;
/// Upper bound for closing or logging out a session being torn down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub pairing_timeout: Duration,
    pub country_code: String,
}

impl SupervisorSettings {
    pub fn from_config(config: &SwitchboardConfig) -> Self {
        let supervisor = &config.supervisor;
        Self {
            backoff: Backoff::new(
                supervisor.backoff_min(),
                supervisor.backoff_max(),
                supervisor.backoff_jitter,
            ),
            heartbeat_interval: supervisor.heartbeat_interval(),
            pairing_timeout: supervisor.pairing_timeout(),
            country_code: config.whatsapp.default_country_code.clone(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&SwitchboardConfig::default())
    }
}

/// Connection state of one device, owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    QrReady { qr: String },
    PairingReady { code: String },
    Connected,
    /// `terminal` is set after a logout; no reconnect follows.
    Disconnected { terminal: bool },
}

impl SessionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Initializing => ConnectionStatus::Initializing,
            Self::QrReady { .. } => ConnectionStatus::QrReady,
            Self::PairingReady { .. } => ConnectionStatus::PairingReady,
            Self::Connected => ConnectionStatus::Connected,
            Self::Disconnected { terminal: false } => ConnectionStatus::Disconnected,
            Self::Disconnected { terminal: true } => ConnectionStatus::LoggedOut,
        }
    }

    pub fn qr(&self) -> Option<&str> {
        match self {
            Self::QrReady { qr } => Some(qr),
            _ => None,
        }
    }
}

/// Result of [`Supervisor::request_pairing_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Already linked; nothing was changed.
    Connected,
    CodeReady(String),
    Timeout,
}

/// Receives inbound events from live sessions, one at a time per session.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, device: &Device, session: &dyn TransportSession, event: InboundEvent);
}

#[async_trait]
impl InboundHandler for InboundPipeline {
    async fn handle(&self, device: &Device, session: &dyn TransportSession, event: InboundEvent) {
        let outcome = InboundPipeline::handle(self, device, session, event).await;
        if !matches!(outcome, PipelineOutcome::Dropped(_)) {
            debug!(device_id = %device.id, ?outcome, "inbound message handled");
        }
    }
}

struct Live {
    session: Arc<dyn TransportSession>,
    /// Stops the event loop, the inbound worker and the heartbeat.
    cancel: CancellationToken,
}

struct SlotInner {
    /// Bumped whenever a session is opened or torn down. Events from an
    /// older generation are ignored.
    generation: u64,
    live: Option<Live>,
    retry: Option<CancellationToken>,
    /// Consecutive failed or dropped sessions, for backoff.
    failures: u32,
    mode: LoginMode,
}

struct DeviceSlot {
    state: watch::Sender<SessionState>,
    inner: Mutex<SlotInner>,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(SessionState::Disconnected { terminal: false }),
            inner: Mutex::new(SlotInner {
                generation: 0,
                live: None,
                retry: None,
                failures: 0,
                mode: LoginMode::Qr,
            }),
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    inbound: Arc<dyn InboundHandler>,
    settings: SupervisorSettings,
    slots: DashMap<String, Arc<DeviceSlot>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        inbound: Arc<dyn InboundHandler>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                credentials,
                inbound,
                settings,
                slots: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    fn slot(&self, device_id: &str) -> Arc<DeviceSlot> {
        let entry = self
            .inner
            .slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceSlot::new()));
        Arc::clone(entry.value())
    }

    async fn device(&self, device_id: &str) -> Result<Device> {
        self.inner
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| Error::device_not_found(device_id))
    }

    /// Current state, or `None` for a device the supervisor never saw.
    pub fn state(&self, device_id: &str) -> Option<SessionState> {
        self.inner
            .slots
            .get(device_id)
            .map(|slot| slot.state.borrow().clone())
    }

    /// Ids of devices with a live session handle, sorted.
    pub async fn sessions(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<DeviceSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut live = Vec::new();
        for (id, slot) in slots {
            if slot.inner.lock().await.live.is_some() {
                live.push(id);
            }
        }
        live.sort();
        live
    }

    /// Open a session for `device` unless one is already live.
    pub async fn start(&self, device: &Device) -> SessionState {
        let slot = self.slot(&device.id);
        let mut inner = slot.inner.lock().await;
        if inner.live.is_none() {
            if let Some(retry) = inner.retry.take() {
                retry.cancel();
            }
            self.open(&slot, &mut inner, device.clone(), LoginMode::Qr)
                .await;
        }
        drop(inner);
        slot.state.borrow().clone()
    }

    /// Start a device the supervisor has never seen. Devices that were
    /// started before (including logged-out ones) are left alone.
    pub async fn ensure_started(&self, device: &Device) -> bool {
        if self.inner.slots.contains_key(&device.id) {
            return false;
        }
        self.start(device).await;
        true
    }

    /// Look the device up and start it. Used by `GET /scan`.
    pub async fn scan(&self, device_id: &str) -> Result<SessionState> {
        let device = self.device(device_id).await?;
        Ok(self.start(&device).await)
    }

    /// Switch the device to pairing-code login and wait for the code.
    pub async fn request_pairing_code(&self, device_id: &str) -> Result<PairingOutcome> {
        let device = self.device(device_id).await?;
        let phone = normalize_phone(&device.phone_number, &self.inner.settings.country_code);
        if phone.is_empty() {
            return Err(Error::invalid_input(format!(
                "device {device_id} has no phone number to pair with"
            )));
        }

        let slot = self.slot(device_id);
        let mut rx = {
            let mut inner = slot.inner.lock().await;
            let connected = *slot.state.borrow() == SessionState::Connected;
            if connected && inner.live.is_some() {
                return Ok(PairingOutcome::Connected);
            }
            if let Some(retry) = inner.retry.take() {
                retry.cancel();
            }
            if let Some(old) = inner.live.take() {
                inner.generation += 1;
                old.cancel.cancel();
                close_quietly(device_id, old.session.as_ref()).await;
            }
            let rx = slot.state.subscribe();
            self.open(&slot, &mut inner, device, LoginMode::PairingCode {
                phone_number: phone,
            })
            .await;
            rx
        };

        let wait = rx.wait_for(|s| {
            matches!(s, SessionState::PairingReady { .. } | SessionState::Connected)
        });
        let outcome = match tokio::time::timeout(self.inner.settings.pairing_timeout, wait).await {
            Ok(Ok(state)) => match &*state {
                SessionState::PairingReady { code } => PairingOutcome::CodeReady(code.clone()),
                _ => PairingOutcome::Connected,
            },
            Ok(Err(_)) | Err(_) => PairingOutcome::Timeout,
        };
        if outcome == PairingOutcome::Timeout {
            warn!(device_id, "pairing code not issued in time");
        }
        Ok(outcome)
    }

    /// Destroy the live session and erase the device's credentials. The next
    /// start begins an unauthenticated login.
    pub async fn reset(&self, device_id: &str) -> Result<()> {
        self.device(device_id).await?;
        let slot = self.slot(device_id);
        let mut inner = slot.inner.lock().await;
        if let Some(retry) = inner.retry.take() {
            retry.cancel();
        }
        inner.generation += 1;
        inner.failures = 0;
        inner.mode = LoginMode::Qr;
        if let Some(live) = inner.live.take() {
            live.cancel.cancel();
            match tokio::time::timeout(TEARDOWN_TIMEOUT, live.session.logout()).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => debug!(device_id, error = %e, "logout during reset failed"),
                Err(_) => debug!(device_id, "logout during reset timed out"),
            }
        }
        let erased = self.inner.credentials.erase(device_id).await;
        self.publish(&slot, device_id, SessionState::Disconnected { terminal: false })
            .await;
        erased?;
        info!(device_id, "session reset, credentials erased");
        Ok(())
    }

    /// Close every session without erasing credentials and stop all retries.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let slots: Vec<(String, Arc<DeviceSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (device_id, slot) in slots {
            let mut inner = slot.inner.lock().await;
            inner.generation += 1;
            if let Some(retry) = inner.retry.take() {
                retry.cancel();
            }
            if let Some(live) = inner.live.take() {
                live.cancel.cancel();
                close_quietly(&device_id, live.session.as_ref()).await;
                self.publish(&slot, &device_id, SessionState::Disconnected { terminal: false })
                    .await;
            }
        }
        info!("supervisor stopped");
    }

    /// Open a session into `inner`, which must have no live session. A
    /// failed connect schedules a retry.
    async fn open(
        &self,
        slot: &Arc<DeviceSlot>,
        inner: &mut SlotInner,
        device: Device,
        mode: LoginMode,
    ) {
        inner.generation += 1;
        let generation = inner.generation;
        inner.mode = mode.clone();
        self.publish(slot, &device.id, SessionState::Initializing)
            .await;

        let credentials = match self.inner.credentials.load(&device.id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(
                    device_id = %device.id,
                    error = %e,
                    "failed to load credentials, starting fresh login"
                );
                None
            },
        };
        let request = ConnectRequest {
            device_id: device.id.clone(),
            credentials,
            mode,
        };

        #[cfg(feature = "metrics")]
        {
            let login = match &request.mode {
                LoginMode::Qr => "qr",
                LoginMode::PairingCode { .. } => "pairing_code",
            };
            switchboard_metrics::counter!(
                switchboard_metrics::session::STARTS_TOTAL,
                switchboard_metrics::labels::MODE => login
            )
            .increment(1);
        }

        match self.inner.transport.connect(request).await {
            Ok(connection) => {
                let cancel = self.inner.shutdown.child_token();
                inner.live = Some(Live {
                    session: Arc::clone(&connection.session),
                    cancel: cancel.clone(),
                });
                info!(
                    device_id = %device.id,
                    generation,
                    transport = self.inner.transport.name(),
                    "session opened"
                );
                tokio::spawn(self.clone().run_session(
                    device,
                    generation,
                    connection.session,
                    connection.events,
                    cancel,
                ));
            },
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "failed to open session");
                self.publish(slot, &device.id, SessionState::Disconnected { terminal: false })
                    .await;
                self.schedule_retry(inner, &device.id);
            },
        }
    }

    /// Mirror `state` to watchers and the status table. Callers hold the
    /// slot lock so writes for one device stay ordered.
    async fn publish(&self, slot: &DeviceSlot, device_id: &str, state: SessionState) {
        let record = StatusRecord {
            id: device_id.to_string(),
            status: state.status(),
            qr_code: state.qr().map(str::to_string),
            updated_at: now_ms(),
        };
        debug!(device_id, status = %record.status, "session state");
        let connected = state == SessionState::Connected;
        let was_connected = slot.state.send_replace(state) == SessionState::Connected;

        #[cfg(feature = "metrics")]
        if connected != was_connected {
            let gauge = switchboard_metrics::gauge!(switchboard_metrics::session::CONNECTED);
            if connected {
                gauge.increment(1.0);
            } else {
                gauge.decrement(1.0);
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (connected, was_connected);
        if let Err(e) = self.inner.store.upsert_status(&record).await {
            warn!(device_id, error = %e, "failed to persist session status");
        }
    }

    fn schedule_retry(&self, inner: &mut SlotInner, device_id: &str) {
        inner.failures = inner.failures.saturating_add(1);
        let attempt = inner.failures;
        let delay = self.inner.settings.backoff.delay(attempt);
        let token = self.inner.shutdown.child_token();
        if let Some(previous) = inner.retry.replace(token.clone()) {
            previous.cancel();
        }
        warn!(
            device_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        #[cfg(feature = "metrics")]
        switchboard_metrics::counter!(switchboard_metrics::session::RECONNECTS_TOTAL).increment(1);

        let this = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {},
                () = tokio::time::sleep(delay) => this.retry(&device_id, token).await,
            }
        });
    }

    /// Reconnect with a fresh copy of the device record.
    async fn retry(&self, device_id: &str, token: CancellationToken) {
        let slot = self.slot(device_id);
        let device = match self.inner.store.get_device(device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                info!(device_id, "device no longer exists, not reconnecting");
                let mut inner = slot.inner.lock().await;
                if !token.is_cancelled() {
                    inner.retry = None;
                }
                return;
            },
            Err(e) => {
                warn!(device_id, error = %e, "failed to reload device for reconnect");
                let mut inner = slot.inner.lock().await;
                if !token.is_cancelled() && inner.live.is_none() {
                    self.schedule_retry(&mut inner, device_id);
                }
                return;
            },
        };

        let mut inner = slot.inner.lock().await;
        if token.is_cancelled() || inner.live.is_some() {
            return;
        }
        inner.retry = None;
        // The pairing phone follows the device record, which may have changed.
        let mode = match &inner.mode {
            LoginMode::Qr => LoginMode::Qr,
            LoginMode::PairingCode { .. } => LoginMode::PairingCode {
                phone_number: normalize_phone(
                    &device.phone_number,
                    &self.inner.settings.country_code,
                ),
            },
        };
        info!(device_id, attempt = inner.failures, "reconnecting");
        self.open(&slot, &mut inner, device, mode).await;
    }

    /// Apply a state reported by session `generation`. Returns `false` if
    /// that session is no longer current.
    async fn transition(&self, device_id: &str, generation: u64, state: SessionState) -> bool {
        let slot = self.slot(device_id);
        let mut inner = slot.inner.lock().await;
        if inner.generation != generation || inner.live.is_none() {
            return false;
        }
        if state == SessionState::Connected {
            inner.failures = 0;
        }
        self.publish(&slot, device_id, state).await;
        true
    }

    async fn on_close(&self, device_id: &str, generation: u64, reason: CloseReason) {
        let slot = self.slot(device_id);
        let live = {
            let mut inner = slot.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            let Some(live) = inner.live.take() else {
                return;
            };
            inner.generation += 1;
            live.cancel.cancel();

            let terminal = reason.is_terminal();
            #[cfg(feature = "metrics")]
            {
                let label = if terminal { "logged_out" } else { "transient" };
                switchboard_metrics::counter!(
                    switchboard_metrics::session::CLOSES_TOTAL,
                    switchboard_metrics::labels::REASON => label
                )
                .increment(1);
            }
            self.publish(&slot, device_id, SessionState::Disconnected { terminal })
                .await;
            if terminal {
                info!(device_id, %reason, "session logged out, reset required");
            } else {
                info!(device_id, %reason, "session closed");
                self.schedule_retry(&mut inner, device_id);
            }
            live
        };
        close_quietly(device_id, live.session.as_ref()).await;
    }

    async fn run_session(
        self,
        device: Device,
        generation: u64,
        session: Arc<dyn TransportSession>,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(run_inbound(
            Arc::clone(&self.inner.inbound),
            device.clone(),
            Arc::clone(&session),
            inbound_rx,
            cancel.clone(),
        ));
        let mut heartbeat_started = false;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                self.on_close(
                    &device.id,
                    generation,
                    CloseReason::ConnectionLost("event stream ended".into()),
                )
                .await;
                break;
            };
            match event {
                TransportEvent::Qr(qr) => {
                    info!(device_id = %device.id, "QR code ready");
                    self.transition(&device.id, generation, SessionState::QrReady { qr })
                        .await;
                },
                TransportEvent::PairingCode(code) => {
                    info!(device_id = %device.id, "pairing code ready");
                    self.transition(&device.id, generation, SessionState::PairingReady { code })
                        .await;
                },
                TransportEvent::Open { phone_number } => {
                    if self
                        .transition(&device.id, generation, SessionState::Connected)
                        .await
                    {
                        info!(
                            device_id = %device.id,
                            phone = phone_number.as_deref().unwrap_or("-"),
                            "session connected"
                        );
                        if !heartbeat_started {
                            heartbeat_started = true;
                            spawn_heartbeat(
                                Arc::clone(&self.inner.store),
                                device.id.clone(),
                                self.inner.settings.heartbeat_interval,
                                cancel.child_token(),
                            );
                        }
                    }
                },
                TransportEvent::Close(reason) => {
                    self.on_close(&device.id, generation, reason).await;
                    break;
                },
                TransportEvent::CredentialsUpdated(credentials) => {
                    if let Err(e) = self.inner.credentials.save(&device.id, &credentials).await {
                        warn!(
                            device_id = %device.id,
                            error = %e,
                            "failed to save rotated credentials"
                        );
                    }
                },
                TransportEvent::Inbound(inbound) => {
                    if inbound_tx.send(inbound).await.is_err() {
                        debug!(device_id = %device.id, "inbound worker gone");
                    }
                },
            }
        }
        debug!(device_id = %device.id, generation, "session loop ended");
    }

    /// Live and connected session for a device.
    pub async fn connected_session(&self, device_id: &str) -> Option<Arc<dyn TransportSession>> {
        let slot = self.inner.slots.get(device_id).map(|s| Arc::clone(s.value()))?;
        let inner = slot.inner.lock().await;
        let connected = *slot.state.borrow() == SessionState::Connected;
        inner
            .live
            .as_ref()
            .filter(|_| connected)
            .map(|live| Arc::clone(&live.session))
    }
}

#[async_trait]
impl SessionDirectory for Supervisor {
    async fn session_for(&self, device_id: &str) -> Option<Arc<dyn TransportSession>> {
        self.connected_session(device_id).await
    }
}

/// Process inbound events for one session in arrival order.
async fn run_inbound(
    handler: Arc<dyn InboundHandler>,
    device: Device,
    session: Arc<dyn TransportSession>,
    mut rx: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(device_id = %device.id, "inbound handling cancelled");
                break;
            },
            () = handler.handle(&device, session.as_ref(), event) => {},
        }
    }
}

async fn close_quietly(device_id: &str, session: &dyn TransportSession) {
    match tokio::time::timeout(TEARDOWN_TIMEOUT, session.close()).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => debug!(device_id, error = %e, "session close failed"),
        Err(_) => debug!(device_id, "session close timed out"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    };

    use {
        super::*,
        switchboard_channels::{
            Credentials, InboundKind, LoopbackTransport, MemoryCredentialStore,
        },
        switchboard_store::InMemoryStore,
    };

    use crate::test_support::FaultyStore;

    /// Starts handling, then hangs for an hour before finishing.
    #[derive(Default)]
    struct StuckHandler {
        started: AtomicBool,
        finished: AtomicBool,
    }

    #[async_trait]
    impl InboundHandler for StuckHandler {
        async fn handle(
            &self,
            _device: &Device,
            _session: &dyn TransportSession,
            _event: InboundEvent,
        ) {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn text_event(text: &str) -> InboundEvent {
        InboundEvent {
            message_id: None,
            kind: InboundKind::Conversation,
            chat_jid: "628123@s.whatsapp.net".into(),
            sender_jid: None,
            push_name: None,
            from_me: false,
            text: Some(text.into()),
            timestamp: None,
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl InboundHandler for RecordingHandler {
        async fn handle(
            &self,
            device: &Device,
            _session: &dyn TransportSession,
            event: InboundEvent,
        ) {
            self.seen
                .lock()
                .unwrap()
                .push((device.id.clone(), event.text.unwrap_or_default()));
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        transport: LoopbackTransport,
        credentials: Arc<MemoryCredentialStore>,
        handler: Arc<RecordingHandler>,
        supervisor: Supervisor,
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 0.0),
            heartbeat_interval: Duration::from_secs(60),
            pairing_timeout: Duration::from_secs(20),
            country_code: "62".into(),
        }
    }

    async fn harness(transport: LoopbackTransport) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        for id in ["dev-1", "dev-2"] {
            store
                .insert_device(&Device {
                    id: id.into(),
                    name: format!("Device {id}"),
                    phone_number: "0812-1111".into(),
                    admin_number: None,
                    created_at: 0,
                })
                .await
                .unwrap();
        }
        let credentials = Arc::new(MemoryCredentialStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(transport.clone()),
            credentials.clone(),
            handler.clone(),
            settings(),
        );
        Harness {
            store,
            transport,
            credentials,
            handler,
            supervisor,
        }
    }

    async fn device(store: &InMemoryStore, id: &str) -> Device {
        store.get_device(id).await.unwrap().unwrap()
    }

    /// Let spawned tasks drain their queues.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_keeps_one_session() {
        let h = harness(LoopbackTransport::new()).await;
        let dev = device(&h.store, "dev-1").await;

        h.supervisor.start(&dev).await;
        h.supervisor.start(&dev).await;
        settle().await;

        assert_eq!(h.transport.connect_count("dev-1"), 1);
        assert_eq!(h.transport.open_sessions("dev-1"), 1);
        assert_eq!(h.supervisor.sessions().await, vec!["dev-1".to_string()]);
        assert_eq!(
            h.supervisor.state("dev-1"),
            Some(SessionState::QrReady {
                qr: "loopback-qr:dev-1".into()
            })
        );
        let status = h.store.get_status("dev-1").await.unwrap().unwrap();
        assert_eq!(status.status, ConnectionStatus::QrReady);
        assert_eq!(status.qr_code.as_deref(), Some("loopback-qr:dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn open_clears_qr_and_connects() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;

        assert_eq!(h.supervisor.state("dev-1"), Some(SessionState::Connected));
        let status = h.store.get_status("dev-1").await.unwrap().unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
        assert_eq!(status.qr_code, None);
        assert!(h.supervisor.connected_session("dev-1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_is_terminal() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;

        h.transport
            .emit("dev-1", TransportEvent::Close(CloseReason::LoggedOut))
            .await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.transport.connect_count("dev-1"), 1);
        assert_eq!(
            h.supervisor.state("dev-1"),
            Some(SessionState::Disconnected { terminal: true })
        );
        assert!(h.supervisor.sessions().await.is_empty());
        let status = h.store.get_status("dev-1").await.unwrap().unwrap();
        assert_eq!(status.status, ConnectionStatus::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_closes_retry_within_backoff_window() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;

        for attempt in 1..=3 {
            assert_eq!(h.transport.connect_count("dev-1"), attempt);
            h.transport
                .emit(
                    "dev-1",
                    TransportEvent::Close(CloseReason::ConnectionLost("blip".into())),
                )
                .await;
            // Never before the minimum delay.
            tokio::time::sleep(Duration::from_millis(1_900)).await;
            assert_eq!(h.transport.connect_count("dev-1"), attempt);
            assert!(h.supervisor.sessions().await.is_empty());
            // Always by the maximum.
            tokio::time::sleep(Duration::from_millis(8_200)).await;
            assert_eq!(h.transport.connect_count("dev-1"), attempt + 1);
            assert_eq!(h.supervisor.state("dev-1"), Some(SessionState::Connected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_exponentially() {
        let transport = LoopbackTransport::new();
        transport.fail_next_connects(2);
        let h = harness(transport).await;
        let started = tokio::time::Instant::now();

        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        assert_eq!(
            h.supervisor.state("dev-1"),
            Some(SessionState::Disconnected { terminal: false })
        );

        // 2s, then 4s.
        tokio::time::sleep(Duration::from_millis(5_900)).await;
        assert_eq!(h.transport.connect_count("dev-1"), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.transport.connect_count("dev-1"), 3);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(matches!(
            h.supervisor.state("dev-1"),
            Some(SessionState::QrReady { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_code_is_returned_and_replaces_qr_session() {
        let h = harness(LoopbackTransport::new()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        let qr_session = h.transport.session("dev-1").unwrap();

        let outcome = h.supervisor.request_pairing_code("dev-1").await.unwrap();
        assert_eq!(outcome, PairingOutcome::CodeReady("LOOP-2468".into()));
        assert!(qr_session.is_closed());
        assert_eq!(h.transport.open_sessions("dev-1"), 1);

        let last = h.transport.connect_requests().pop().unwrap();
        assert_eq!(last.mode, LoginMode::PairingCode {
            phone_number: "628121111".into()
        });
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_code_on_connected_device_changes_nothing() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;

        let outcome = h.supervisor.request_pairing_code("dev-1").await.unwrap();
        assert_eq!(outcome, PairingOutcome::Connected);
        assert_eq!(h.transport.connect_count("dev-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_code_times_out() {
        let h = harness(LoopbackTransport::new()).await;
        h.transport.fail_next_connects(10);

        let outcome = h.supervisor.request_pairing_code("dev-1").await.unwrap();
        assert_eq!(outcome, PairingOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_not_started() {
        let h = harness(LoopbackTransport::new()).await;
        assert!(matches!(
            h.supervisor.scan("nope").await,
            Err(Error::DeviceNotFound { .. })
        ));
        assert!(matches!(
            h.supervisor.request_pairing_code("nope").await,
            Err(Error::DeviceNotFound { .. })
        ));
        assert!(h.transport.connect_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_logs_out_and_erases_credentials() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        h.transport
            .emit(
                "dev-1",
                TransportEvent::CredentialsUpdated(Credentials(serde_json::json!({"me": "x"}))),
            )
            .await;
        settle().await;
        assert!(h.credentials.contains("dev-1"));

        h.supervisor.reset("dev-1").await.unwrap();
        assert!(!h.credentials.contains("dev-1"));
        assert!(h.transport.session("dev-1").unwrap().is_logged_out());
        assert!(h.supervisor.sessions().await.is_empty());

        // No automatic restart, and the next start logs in from scratch.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count("dev-1"), 1);
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        assert_eq!(h.transport.connect_requests().pop().unwrap().credentials, None);
    }

    #[tokio::test(start_paused = true)]
    async fn saved_credentials_are_used_on_reconnect() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        let creds = Credentials(serde_json::json!({"noise": "k"}));
        h.transport
            .emit("dev-1", TransportEvent::CredentialsUpdated(creds.clone()))
            .await;
        h.transport
            .emit("dev-1", TransportEvent::Close(CloseReason::RestartRequired))
            .await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let last = h.transport.connect_requests().pop().unwrap();
        assert_eq!(last.credentials, Some(creds));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_reach_handler_in_order() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        h.supervisor.start(&device(&h.store, "dev-2").await).await;
        settle().await;

        for (device_id, text) in [("dev-1", "a"), ("dev-2", "x"), ("dev-1", "b")] {
            h.transport
                .emit(device_id, TransportEvent::Inbound(text_event(text)))
                .await;
        }
        settle().await;

        let seen = h.handler.seen.lock().unwrap().clone();
        let dev1: Vec<&str> = seen
            .iter()
            .filter(|(d, _)| d == "dev-1")
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(dev1, vec!["a", "b"]);
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_runs_while_connected() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        h.store
            .upsert_status(&StatusRecord {
                id: "dev-1".into(),
                status: ConnectionStatus::Connected,
                qr_code: None,
                updated_at: 0,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let status = h.store.get_status("dev-1").await.unwrap().unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
        assert!(status.updated_at > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_without_erasing() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        h.credentials
            .save("dev-1", &Credentials(serde_json::json!({})))
            .await
            .unwrap();

        h.supervisor.shutdown().await;
        assert!(h.transport.session("dev-1").unwrap().is_closed());
        assert!(!h.transport.session("dev-1").unwrap().is_logged_out());
        assert!(h.credentials.contains("dev-1"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count("dev-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_started_skips_known_devices() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        let dev = device(&h.store, "dev-1").await;
        assert!(h.supervisor.ensure_started(&dev).await);
        settle().await;
        h.transport
            .emit("dev-1", TransportEvent::Close(CloseReason::LoggedOut))
            .await;
        settle().await;
        assert!(!h.supervisor.ensure_started(&dev).await);
        assert_eq!(h.transport.connect_count("dev-1"), 1);
    }

    /// Pin the status row to a known timestamp.
    async fn pin_status(store: &InMemoryStore, status: ConnectionStatus) {
        store
            .upsert_status(&StatusRecord {
                id: "dev-1".into(),
                status,
                qr_code: None,
                updated_at: 7,
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_after_logout() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        h.transport
            .emit("dev-1", TransportEvent::Close(CloseReason::LoggedOut))
            .await;
        settle().await;
        pin_status(&h.store, ConnectionStatus::LoggedOut).await;

        tokio::time::sleep(Duration::from_secs(190)).await;
        let status = h.store.get_status("dev-1").await.unwrap().unwrap();
        assert_eq!(status.updated_at, 7);
        assert_eq!(status.status, ConnectionStatus::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_after_reset() {
        let h = harness(LoopbackTransport::auto_connect()).await;
        h.supervisor.start(&device(&h.store, "dev-1").await).await;
        settle().await;
        h.supervisor.reset("dev-1").await.unwrap();
        pin_status(&h.store, ConnectionStatus::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(190)).await;
        assert_eq!(
            h.store.get_status("dev-1").await.unwrap().unwrap().updated_at,
            7
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_abandons_inbound_work_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_device(&Device {
                id: "dev-1".into(),
                name: "Front desk".into(),
                phone_number: "0812-1111".into(),
                admin_number: None,
                created_at: 0,
            })
            .await
            .unwrap();
        let transport = LoopbackTransport::auto_connect();
        let handler = Arc::new(StuckHandler::default());
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(MemoryCredentialStore::new()),
            handler.clone(),
            settings(),
        );
        supervisor.start(&device(&store, "dev-1").await).await;
        settle().await;

        transport
            .emit("dev-1", TransportEvent::Inbound(text_event("hello")))
            .await;
        settle().await;
        assert!(handler.started.load(Ordering::SeqCst));

        // Reset does not wait for the handler.
        tokio::time::timeout(Duration::from_secs(1), supervisor.reset("dev-1"))
            .await
            .expect("reset waited on inbound handling")
            .unwrap();
        tokio::time::sleep(Duration::from_secs(7_200)).await;
        assert!(!handler.finished.load(Ordering::SeqCst));
        assert!(supervisor.sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_uses_the_current_device_record() {
        let memory = Arc::new(InMemoryStore::new());
        memory
            .insert_device(&Device {
                id: "dev-1".into(),
                name: "Front desk".into(),
                phone_number: "0812-1111".into(),
                admin_number: None,
                created_at: 0,
            })
            .await
            .unwrap();
        let store = Arc::new(FaultyStore::new(memory.clone()));
        let transport = LoopbackTransport::new();
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(RecordingHandler::default()),
            settings(),
        );

        let outcome = supervisor.request_pairing_code("dev-1").await.unwrap();
        assert_eq!(outcome, PairingOutcome::CodeReady("LOOP-2468".into()));

        let mut updated = device(&memory, "dev-1").await;
        updated.phone_number = "0813-2222".into();
        store.replace_device(updated);
        transport
            .emit(
                "dev-1",
                TransportEvent::Close(CloseReason::ConnectionLost("blip".into())),
            )
            .await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let requests = transport.connect_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].mode, LoginMode::PairingCode {
            phone_number: "628132222".into()
        });
    }
}
