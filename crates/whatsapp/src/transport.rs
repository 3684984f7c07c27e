use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    switchboard_channels::{
        ConnectRequest, Error, LoginMode, Presence, Result, Transport, TransportConnection,
        TransportSession,
    },
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use crate::{
    process::{SidecarLaunch, SidecarProcess, find_sidecar_dir, start_sidecar},
    sidecar::{DEFAULT_SIDECAR_PORT, SidecarClient},
    types::GatewayMessage,
};

const CONNECT_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct SidecarSettings {
    pub port: u16,
    pub sidecar_dir: Option<PathBuf>,
    /// Start the sidecar ourselves instead of expecting one on `port`.
    pub spawn_sidecar: bool,
    pub send_timeout: Duration,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIDECAR_PORT,
            sidecar_dir: None,
            spawn_sidecar: true,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// [`Transport`] that drives every device through one shared sidecar.
///
/// The sidecar is started (if configured) and connected lazily on the first
/// `connect`, and reconnected on demand after it goes away.
pub struct SidecarTransport {
    settings: SidecarSettings,
    client: Mutex<Option<Arc<SidecarClient>>>,
    process: Mutex<Option<SidecarProcess>>,
}

impl SidecarTransport {
    pub fn new(settings: SidecarSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    async fn ensure_process(&self) -> Result<()> {
        if !self.settings.spawn_sidecar {
            return Ok(());
        }
        let mut process = self.process.lock().await;
        if let Some(running) = process.as_mut()
            && running.is_running()
        {
            return Ok(());
        }
        let dir = find_sidecar_dir(self.settings.sidecar_dir.as_deref())?;
        let launch = SidecarLaunch {
            dir,
            port: self.settings.port,
        };
        *process = Some(start_sidecar(&launch).await?);
        Ok(())
    }

    async fn client(&self) -> Result<Arc<SidecarClient>> {
        let mut client = self.client.lock().await;
        if let Some(existing) = client.as_ref()
            && existing.is_connected()
        {
            return Ok(Arc::clone(existing));
        }
        self.ensure_process().await?;
        let fresh = SidecarClient::connect_with_retry(self.settings.port, CONNECT_ATTEMPTS).await?;
        *client = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Stop the sidecar process if this transport started it.
    pub async fn shutdown(&self) {
        self.client.lock().await.take();
        if let Some(mut process) = self.process.lock().await.take() {
            process.stop().await;
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    fn name(&self) -> &'static str {
        "whatsapp-sidecar"
    }

    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection> {
        if request.device_id.is_empty() {
            return Err(Error::invalid_input("device id must not be empty"));
        }
        let client = self.client().await?;
        let (route_id, events) = client.register(&request.device_id);

        let pairing_phone = match request.mode {
            LoginMode::Qr => None,
            LoginMode::PairingCode { phone_number } => Some(phone_number),
        };
        let login = GatewayMessage::Login {
            account_id: request.device_id.clone(),
            credentials: request.credentials,
            pairing_phone,
        };
        if let Err(e) = client.send(login) {
            client.unregister(&request.device_id, route_id);
            return Err(e);
        }
        info!(device_id = %request.device_id, "sidecar login requested");

        let session = SidecarSession {
            client,
            account_id: request.device_id,
            route_id,
            send_timeout: self.settings.send_timeout,
        };
        Ok(TransportConnection {
            session: Arc::new(session),
            events,
        })
    }
}

struct SidecarSession {
    client: Arc<SidecarClient>,
    account_id: String,
    route_id: u64,
    send_timeout: Duration,
}

#[async_trait]
impl TransportSession for SidecarSession {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        if !self.client.is_connected() {
            return Err(Error::not_connected(&self.account_id));
        }
        self.client
            .send_text(&self.account_id, to, text, self.send_timeout)
            .await
    }

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<()> {
        self.client.send(GatewayMessage::Presence {
            account_id: self.account_id.clone(),
            to: to.to_string(),
            presence: presence.as_str().to_string(),
        })
    }

    async fn logout(&self) -> Result<()> {
        let result = self.client.send(GatewayMessage::Logout {
            account_id: self.account_id.clone(),
        });
        self.client.unregister(&self.account_id, self.route_id);
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.client.send(GatewayMessage::Close {
            account_id: self.account_id.clone(),
        });
        self.client.unregister(&self.account_id, self.route_id);
        if let Err(e) = &result {
            warn!(account_id = %self.account_id, error = %e, "sidecar close not delivered");
        }
        result
    }
}
