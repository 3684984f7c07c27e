//! Config schema: server, store, AI provider, reply policy, supervisor,
//! handover, WhatsApp transport and metrics.
use std::{path::PathBuf, time::Duration};

use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use crate::duration::parse_duration;

/// Root configuration, built once at startup and passed to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ai: AiConfig,
    pub reply: ReplyConfig,
    pub supervisor: SupervisorConfig,
    pub handover: HandoverConfig,
    pub whatsapp: WhatsAppConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 5005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection URL.
    pub database_url: String,
    /// How often the change feed looks for rows written by other processes.
    pub poll_interval: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://switchboard.db?mode=rwc".into(),
            poll_interval: "1s".into(),
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProviderKind {
    #[default]
    Gemini,
    /// Any server speaking the OpenAI embeddings + chat completions API.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub provider: AiProviderKind,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    /// Override for the provider's API base URL.
    pub base_url: Option<String>,
    pub embedding_model: String,
    pub generation_model: String,
    pub request_timeout: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProviderKind::Gemini,
            api_key: None,
            base_url: None,
            embedding_model: "text-embedding-004".into(),
            generation_model: "gemini-2.5-flash".into(),
            request_timeout: "20s".into(),
        }
    }
}

impl AiConfig {
    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(20))
    }
}

fn serialize_option_secret<S: serde::Serializer>(
    _value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("[REDACTED]")
}

/// Retrieval-gated auto-reply policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Minimum cosine similarity a knowledge chunk must exceed.
    pub confidence_threshold: f32,
    pub top_k: usize,
    /// Answers shorter than this (after trimming) count as no answer.
    pub min_answer_chars: usize,
    pub no_answer_sentinel: String,
    /// Show "typing…" while a reply is being generated.
    pub presence_updates: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            top_k: 3,
            min_answer_chars: 5,
            no_answer_sentinel: "NO_ANSWER".into(),
            presence_updates: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_min: String,
    pub backoff_max: String,
    /// Fraction of the computed delay added as random jitter, `0.0..=1.0`.
    pub backoff_jitter: f64,
    pub heartbeat_interval: String,
    pub pairing_timeout: String,
    pub send_timeout: String,
    /// Where session credentials live. Defaults to `<data dir>/auth`.
    pub auth_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_min: "2s".into(),
            backoff_max: "30s".into(),
            backoff_jitter: 0.2,
            heartbeat_interval: "60s".into(),
            pairing_timeout: "20s".into(),
            send_timeout: "30s".into(),
            auth_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn backoff_min(&self) -> Duration {
        parse_duration(&self.backoff_min)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(2))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration(&self.backoff_max)
            .unwrap_or(Duration::from_secs(30))
            .max(self.backoff_min())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn pairing_timeout(&self) -> Duration {
        parse_duration(&self.pairing_timeout).unwrap_or(Duration::from_secs(20))
    }

    pub fn send_timeout(&self) -> Duration {
        parse_duration(&self.send_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.auth_dir
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("auth"))
    }
}

/// Texts sent when a conversation is handed to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    pub user_notice: String,
    /// Placeholders: `{user}`, `{device}`, `{message}`.
    pub admin_template: String,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            user_notice: "Mohon tunggu sebentar, staf kami akan segera membantu Anda. 😊".into(),
            admin_template: "⚠️ *HANDOVER REQUEST*\n\nDevice: {device}\nUser: wa.me/{user}\nMsg: _{message}_\n\nSilakan cek Dashboard.".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Baileys Node sidecar over a local websocket.
    #[default]
    Sidecar,
    /// In-process transport that never reaches WhatsApp. Useful for demos.
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub transport: TransportKind,
    pub sidecar_port: u16,
    pub sidecar_dir: Option<PathBuf>,
    /// Launch the sidecar process; disable when it runs under its own supervisor.
    pub spawn_sidecar: bool,
    /// Replaces a national `0` prefix when normalizing phone numbers.
    pub default_country_code: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Sidecar,
            sidecar_port: 9877,
            sidecar_dir: None,
            spawn_sidecar: true,
            default_country_code: "62".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
