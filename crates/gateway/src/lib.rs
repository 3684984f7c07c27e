//! Gateway: the multi-device WhatsApp worker.
//!
//! Lifecycle:
//! 1. Validate config, open the store and run migrations
//! 2. Build the AI providers and the inbound pipeline
//! 3. Start a session for every device (and for devices added later)
//! 4. Dispatch operator-authored outbound messages from the change feed
//! 5. Serve the control API until Ctrl-C, then close every session
//!
//! Session ownership lives in [`supervisor`]; everything else talks to
//! devices through it.

pub mod backoff;
pub mod device_watch;
pub mod error;
pub mod heartbeat;
#[cfg(feature = "metrics")]
pub mod metrics_middleware;
pub mod outbound;
pub mod qr;
pub mod server;
pub mod state;
pub mod supervisor;
#[cfg(test)]
mod test_support;
pub mod webhook;

pub use {
    error::{Error, Result},
    server::{build_gateway_app, connect_store, start_gateway},
    state::GatewayState,
    supervisor::{InboundHandler, PairingOutcome, SessionState, Supervisor, SupervisorSettings},
};
