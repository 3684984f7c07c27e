//! Websocket client for the sidecar.
//!
//! One client multiplexes every account. Session events are routed to the
//! receiver registered for their account; `send_result` replies complete
//! the matching pending request.
//!
//! The reader never waits on a route. A route whose receiver falls
//! `ROUTE_BUFFER` events behind is dropped, which ends that session's event
//! stream as a lost connection while every other account keeps flowing.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::{SinkExt, StreamExt},
    switchboard_channels::{CloseReason, Error, Result, TransportEvent},
    tokio::sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
};

use crate::types::{GatewayMessage, SidecarMessage};

pub const DEFAULT_SIDECAR_PORT: u16 = 9877;

const ROUTE_BUFFER: usize = 256;

struct Route {
    id: u64,
    tx: mpsc::Sender<TransportEvent>,
}

type SendReply = std::result::Result<(), String>;

pub struct SidecarClient {
    outgoing: mpsc::UnboundedSender<GatewayMessage>,
    routes: Mutex<HashMap<String, Route>>,
    pending: Mutex<HashMap<String, oneshot::Sender<SendReply>>>,
    connected: AtomicBool,
    next_route: AtomicU64,
}

impl SidecarClient {
    /// Connect to the sidecar on `127.0.0.1:port` and start the reader and
    /// writer tasks.
    pub async fn connect(port: u16) -> Result<Arc<Self>> {
        let url = format!("ws://127.0.0.1:{port}");
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::external(format!("connecting to sidecar at {url}"), e))?;
        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<GatewayMessage>();

        let client = Arc::new(Self {
            outgoing,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            next_route: AtomicU64::new(1),
        });

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let payload = match serde_json::to_string(&msg) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to encode sidecar message");
                        continue;
                    },
                };
                if let Err(e) = sink.send(Message::text(payload)).await {
                    warn!(error = %e, "sidecar write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SidecarMessage>(&text) {
                        Ok(msg) => reader.dispatch(msg),
                        Err(e) => warn!(error = %e, "unparseable sidecar message"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {},
                    Err(e) => {
                        warn!(error = %e, "sidecar read failed");
                        break;
                    },
                }
            }
            reader.on_disconnect();
        });

        info!(port, "connected to WhatsApp sidecar");
        Ok(client)
    }

    /// Connect, retrying while the sidecar process is still starting.
    pub async fn connect_with_retry(port: u16, attempts: u32) -> Result<Arc<Self>> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match Self::connect(port).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(attempt, error = %e, "sidecar not ready");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                },
            }
        }
        Err(last_err.unwrap_or_else(|| Error::unavailable("sidecar not reachable")))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Route events for `account_id` to a new receiver, replacing any
    /// previous route. Returns the route id for [`Self::unregister`].
    pub fn register(&self, account_id: &str) -> (u64, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(ROUTE_BUFFER);
        let id = self.next_route.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string(), Route { id, tx });
        (id, rx)
    }

    /// Drop the route if it is still the one registered under `route_id`.
    pub fn unregister(&self, account_id: &str, route_id: u64) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.get(account_id).is_some_and(|r| r.id == route_id) {
            routes.remove(account_id);
        }
    }

    /// Queue a message without waiting for an answer.
    pub fn send(&self, msg: GatewayMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::unavailable("sidecar disconnected"));
        }
        self.outgoing
            .send(msg)
            .map_err(|_| Error::unavailable("sidecar writer stopped"))
    }

    /// Send a text and wait for the sidecar's `send_result`.
    pub async fn send_text(
        &self,
        account_id: &str,
        to: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);

        let queued = self.send(GatewayMessage::SendText {
            request_id: request_id.clone(),
            account_id: account_id.to_string(),
            to: to.to_string(),
            text: text.to_string(),
        });
        if let Err(e) = queued {
            self.take_pending(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(Error::rejected(message)),
            Ok(Err(_)) => Err(Error::unavailable("sidecar disconnected before replying")),
            Err(_) => {
                self.take_pending(&request_id);
                Err(Error::Timeout {
                    operation: "sidecar send",
                })
            },
        }
    }

    fn take_pending(&self, request_id: &str) -> Option<oneshot::Sender<SendReply>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
    }

    fn dispatch(&self, msg: SidecarMessage) {
        match msg {
            SidecarMessage::SendResult {
                request_id,
                success,
                error,
            } => {
                if let Some(tx) = self.take_pending(&request_id) {
                    let reply = if success {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "send failed".into()))
                    };
                    let _ = tx.send(reply);
                }
            },
            SidecarMessage::Error { account_id, error } => {
                warn!(account_id = account_id.as_deref().unwrap_or("-"), %error, "sidecar error");
            },
            other => {
                if let Some((account_id, event)) = other.into_event() {
                    self.route_event(&account_id, event);
                }
            },
        }
    }

    fn route_event(&self, account_id: &str, event: TransportEvent) {
        let route = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account_id)
            .map(|r| (r.id, r.tx.clone()));
        let Some((route_id, tx)) = route else {
            debug!(account_id, "no route for sidecar event");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Closed(_)) => {
                debug!(account_id, "route closed, dropping sidecar event");
            },
            Err(TrySendError::Full(_)) => {
                warn!(
                    account_id,
                    "session is not keeping up with sidecar events, dropping its route"
                );
                self.unregister(account_id, route_id);
            },
        }
    }

    /// Every routed session sees a lost connection; pending sends fail.
    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        warn!("WhatsApp sidecar connection closed");

        let routes: Vec<(String, Route)> = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (account_id, route) in routes {
            let event = TransportEvent::Close(CloseReason::ConnectionLost(
                "sidecar connection closed".into(),
            ));
            // A full route still ends its stream once the sender is dropped.
            if route.tx.try_send(event).is_err() {
                debug!(account_id, "route closed or full, ending its stream");
            }
        }

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        tokio::net::TcpListener,
        tokio_tungstenite::accept_async,
    };

    /// A sidecar that answers every `send_text` with success and replies to a
    /// `login` with a QR code.
    async fn fake_sidecar() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let reply = match serde_json::from_str::<GatewayMessage>(&text).unwrap() {
                    GatewayMessage::Login { account_id, .. } => SidecarMessage::Qr {
                        account_id,
                        qr: "qr-data".into(),
                    },
                    GatewayMessage::SendText { request_id, to, .. } => SidecarMessage::SendResult {
                        request_id,
                        success: to != "reject@s.whatsapp.net",
                        error: Some("rejected".into()),
                    },
                    GatewayMessage::Close { .. } => break,
                    _ => continue,
                };
                let payload = serde_json::to_string(&reply).unwrap();
                ws.send(Message::text(payload)).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn routes_events_and_completes_sends() {
        let port = fake_sidecar().await;
        let client = SidecarClient::connect(port).await.unwrap();
        let (_, mut events) = client.register("dev-1");

        client
            .send(GatewayMessage::Login {
                account_id: "dev-1".into(),
                credentials: None,
                pairing_phone: None,
            })
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Qr("qr-data".into())
        );

        let timeout = Duration::from_secs(5);
        client
            .send_text("dev-1", "628@s.whatsapp.net", "hi", timeout)
            .await
            .unwrap();
        let err = client
            .send_text("dev-1", "reject@s.whatsapp.net", "hi", timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    }

    /// A sidecar that waits for the first gateway message, then pushes
    /// `frames` in order without reading further.
    async fn flooding_sidecar(frames: Vec<SidecarMessage>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.next().await;
            for frame in frames {
                let payload = serde_json::to_string(&frame).unwrap();
                ws.send(Message::text(payload)).await.unwrap();
            }
            // Keep the socket open.
            while ws.next().await.is_some() {}
        });
        port
    }

    #[tokio::test]
    async fn stalled_route_does_not_block_other_accounts() {
        let qr = |account: &str, n: usize| SidecarMessage::Qr {
            account_id: account.into(),
            qr: format!("qr-{n}"),
        };
        let mut frames: Vec<SidecarMessage> =
            (0..ROUTE_BUFFER + 5).map(|n| qr("dev-1", n)).collect();
        frames.push(qr("dev-2", 0));
        let port = flooding_sidecar(frames).await;

        let client = SidecarClient::connect(port).await.unwrap();
        let (_, mut slow) = client.register("dev-1");
        let (_, mut fast) = client.register("dev-2");
        client
            .send(GatewayMessage::Logout {
                account_id: "dev-1".into(),
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), fast.recv())
            .await
            .expect("dev-2 event stuck behind dev-1")
            .unwrap();
        assert_eq!(event, TransportEvent::Qr("qr-0".into()));

        // The overflowing route was dropped: its buffer drains, then the
        // stream ends.
        let mut drained = 0;
        while let Some(event) = slow.recv().await {
            assert!(matches!(event, TransportEvent::Qr(_)));
            drained += 1;
        }
        assert_eq!(drained, ROUTE_BUFFER);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_closes_every_route() {
        let port = fake_sidecar().await;
        let client = SidecarClient::connect(port).await.unwrap();
        let (_, mut events) = client.register("dev-1");

        client
            .send(GatewayMessage::Close {
                account_id: "dev-1".into(),
            })
            .unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Close(CloseReason::ConnectionLost(_)) => {},
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!client.is_connected());
        assert!(client
            .send(GatewayMessage::Logout {
                account_id: "dev-1".into()
            })
            .is_err());
    }

    #[test]
    fn stale_route_is_not_unregistered() {
        let (outgoing, _rx) = mpsc::unbounded_channel();
        let client = SidecarClient {
            outgoing,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            next_route: AtomicU64::new(1),
        };
        let (old, _) = client.register("dev-1");
        let (new, _) = client.register("dev-1");
        client.unregister("dev-1", old);
        assert!(client.routes.lock().unwrap().get("dev-1").is_some_and(|r| r.id == new));
    }
}
