//! Liveness reporting for connected sessions.

use std::{sync::Arc, time::Duration};

use {
    switchboard_common::{
        now_ms,
        types::{ConnectionStatus, StatusRecord},
    },
    switchboard_store::Store,
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

/// Re-write the device's status row every `interval` until `cancel` fires.
/// Write failures are logged and never end the loop.
pub fn spawn_heartbeat(
    store: Arc<dyn Store>,
    device_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => beat(store.as_ref(), &device_id).await,
            }
        }
        debug!(device_id, "heartbeat stopped");
    })
}

async fn beat(store: &dyn Store, device_id: &str) {
    let at = now_ms();
    let result = match store.touch_status(device_id, at).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            store
                .upsert_status(&StatusRecord {
                    id: device_id.to_string(),
                    status: ConnectionStatus::Connected,
                    qr_code: None,
                    updated_at: at,
                })
                .await
        },
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            #[cfg(feature = "metrics")]
            switchboard_metrics::counter!(switchboard_metrics::session::HEARTBEATS_TOTAL)
                .increment(1);
        },
        Err(e) => warn!(device_id, error = %e, "heartbeat write failed"),
    }
}
