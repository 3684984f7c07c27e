//! WhatsApp transport backed by a Baileys Node sidecar.
//!
//! The sidecar owns the WhatsApp Web protocol. It listens on a local
//! websocket and speaks the JSON messages in [`types`]: the gateway sends
//! `login`, `send_text`, `presence`, `logout` and `close`; the sidecar
//! reports login codes, connection changes, credential rotations and inbound
//! messages per account. Credentials round-trip through the gateway so the
//! sidecar keeps no state of its own.

pub mod process;
pub mod sidecar;
pub mod transport;
pub mod types;

pub use {
    process::{SidecarLaunch, SidecarProcess, find_sidecar_dir, start_sidecar},
    sidecar::{DEFAULT_SIDECAR_PORT, SidecarClient},
    transport::{SidecarSettings, SidecarTransport},
    types::{GatewayMessage, SidecarMessage, close_reason_from_status},
};
