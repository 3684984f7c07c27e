//! In-process transport that never leaves the machine.
//!
//! Used by tests to script session events, and by `whatsapp.transport =
//! "loopback"` to run the gateway without a WhatsApp connection.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    tokio::sync::mpsc,
    tracing::debug,
};

use crate::{
    Error, Result,
    transport::{
        ConnectRequest, LoginMode, Presence, Transport, TransportConnection, TransportEvent,
        TransportSession,
    },
};

const EVENT_BUFFER: usize = 64;

/// A text recorded by a [`LoopbackSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub to: String,
    pub text: String,
}

pub struct LoopbackSession {
    device_id: String,
    sent: Mutex<Vec<SentText>>,
    presences: Mutex<Vec<(String, Presence)>>,
    closed: AtomicBool,
    logged_out: AtomicBool,
    fail_sends: AtomicBool,
}

impl LoopbackSession {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            sent: Mutex::new(Vec::new()),
            presences: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn presences(&self) -> Vec<(String, Presence)> {
        self.presences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Make every following send fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::not_connected(&self.device_id));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::rejected("loopback send failure"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentText {
                to: to.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<()> {
        if self.is_closed() {
            return Err(Error::not_connected(&self.device_id));
        }
        self.presences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to.to_string(), presence));
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Link {
    events: mpsc::Sender<TransportEvent>,
    session: Arc<LoopbackSession>,
}

#[derive(Default)]
struct State {
    connects: Vec<ConnectRequest>,
    links: HashMap<String, Link>,
    failing_connects: usize,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<State>>,
    auto_connect: bool,
}

impl LoopbackTransport {
    /// Sessions emit a QR or pairing code and then wait for scripted events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions report `Open` right after their login code.
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state().failing_connects = n;
    }

    pub fn connect_requests(&self) -> Vec<ConnectRequest> {
        self.state().connects.clone()
    }

    pub fn connect_count(&self, device_id: &str) -> usize {
        self.state()
            .connects
            .iter()
            .filter(|r| r.device_id == device_id)
            .count()
    }

    /// Most recent session opened for a device.
    pub fn session(&self, device_id: &str) -> Option<Arc<LoopbackSession>> {
        self.state()
            .links
            .get(device_id)
            .map(|l| Arc::clone(&l.session))
    }

    /// Number of sessions that are open and not yet closed.
    pub fn open_sessions(&self, device_id: &str) -> usize {
        self.state()
            .links
            .get(device_id)
            .filter(|l| !l.session.is_closed())
            .map_or(0, |_| 1)
    }

    /// Deliver an event on the device's most recent session. Returns `false`
    /// when no consumer is listening.
    pub async fn emit(&self, device_id: &str, event: TransportEvent) -> bool {
        let sender = self.state().links.get(device_id).map(|l| l.events.clone());
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(LoopbackSession::new(&request.device_id));

        let login_event = match &request.mode {
            LoginMode::Qr => TransportEvent::Qr(format!("loopback-qr:{}", request.device_id)),
            LoginMode::PairingCode { .. } => TransportEvent::PairingCode("LOOP-2468".into()),
        };

        {
            let mut state = self.state();
            state.connects.push(request.clone());
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(Error::unavailable("loopback connect failure"));
            }
            // A newer session replaces the previous one for the same device.
            if let Some(old) = state.links.insert(request.device_id.clone(), Link {
                events: tx.clone(),
                session: Arc::clone(&session),
            }) {
                old.session.closed.store(true, Ordering::SeqCst);
            }
        }

        debug!(device_id = %request.device_id, mode = ?request.mode, "loopback connect");

        // The buffer is fresh, so these cannot fail for lack of room.
        let _ = tx.try_send(login_event);
        if self.auto_connect {
            let _ = tx.try_send(TransportEvent::Open { phone_number: None });
        }

        Ok(TransportConnection {
            session,
            events: rx,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn request(device_id: &str, mode: LoginMode) -> ConnectRequest {
        ConnectRequest {
            device_id: device_id.into(),
            credentials: None,
            mode,
        }
    }

    #[tokio::test]
    async fn emits_login_code_for_mode() {
        let transport = LoopbackTransport::new();
        let mut conn = transport
            .connect(request("d1", LoginMode::Qr))
            .await
            .unwrap();
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Qr(_))));

        let mut conn = transport
            .connect(request("d1", LoginMode::PairingCode {
                phone_number: "62811".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::PairingCode("LOOP-2468".into()))
        );
        assert_eq!(transport.connect_count("d1"), 2);
        assert_eq!(transport.open_sessions("d1"), 1);
    }

    #[tokio::test]
    async fn closed_session_rejects_sends() {
        let transport = LoopbackTransport::auto_connect();
        let conn = transport
            .connect(request("d1", LoginMode::Qr))
            .await
            .unwrap();
        conn.session.send_text("62822@s.whatsapp.net", "hi").await.unwrap();
        conn.session.close().await.unwrap();
        assert!(matches!(
            conn.session.send_text("62822@s.whatsapp.net", "again").await,
            Err(Error::NotConnected { .. })
        ));
        assert_eq!(transport.session("d1").unwrap().sent().len(), 1);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let transport = LoopbackTransport::new();
        transport.fail_next_connects(1);
        assert!(transport.connect(request("d1", LoginMode::Qr)).await.is_err());
        assert!(transport.connect(request("d1", LoginMode::Qr)).await.is_ok());
    }
}
