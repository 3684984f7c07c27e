use std::sync::Arc;

use switchboard_store::Store;

use crate::supervisor::Supervisor;

/// Shared state behind every control API handler.
pub struct GatewayState {
    pub version: String,
    pub store: Arc<dyn Store>,
    pub supervisor: Supervisor,
    /// Used to normalize phone numbers arriving on the webhook.
    pub country_code: String,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<switchboard_metrics::MetricsHandle>,
}

impl GatewayState {
    pub fn new(store: Arc<dyn Store>, supervisor: Supervisor) -> Arc<Self> {
        let country_code = supervisor.settings().country_code.clone();
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
            supervisor,
            country_code,
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        })
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(
        store: Arc<dyn Store>,
        supervisor: Supervisor,
        metrics_handle: switchboard_metrics::MetricsHandle,
    ) -> Arc<Self> {
        let country_code = supervisor.settings().country_code.clone();
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
            supervisor,
            country_code,
            metrics_handle: metrics_handle.is_enabled().then_some(metrics_handle),
        })
    }
}
