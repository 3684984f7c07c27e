//! Transport abstraction for per-device messaging sessions.
//!
//! A [`Transport`] opens one [`TransportSession`] per device and reports
//! everything that happens on it as typed [`TransportEvent`]s over a channel,
//! so each device is driven by a single consumer loop. Session credentials
//! are persisted through a [`CredentialStore`].

pub mod credentials;
pub mod error;
pub mod loopback;
pub mod transport;

pub use {
    credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore},
    error::{Error, Result},
    loopback::{LoopbackSession, LoopbackTransport},
    transport::{
        CloseReason, ConnectRequest, InboundEvent, InboundKind, LoginMode, Presence, Transport,
        TransportConnection, TransportEvent, TransportSession,
    },
};
