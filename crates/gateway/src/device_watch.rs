use std::sync::Arc;

use {
    switchboard_store::{Store, StoreEvent},
    tokio::sync::broadcast::error::RecvError,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::supervisor::Supervisor;

/// Start a session for every existing device, then for each device added
/// later. Devices already known to the supervisor are left alone.
pub fn spawn_device_watch(
    store: Arc<dyn Store>,
    supervisor: Supervisor,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut feed = store.subscribe();
        start_all(store.as_ref(), &supervisor).await;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = feed.recv() => event,
            };
            match event {
                Ok(StoreEvent::DeviceInserted(device)) => {
                    if supervisor.ensure_started(&device).await {
                        info!(device_id = %device.id, "new device, session started");
                    }
                },
                Ok(StoreEvent::MessageInserted(_)) => {},
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "device watch lagged behind the change feed, relisting");
                    start_all(store.as_ref(), &supervisor).await;
                },
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn start_all(store: &dyn Store, supervisor: &Supervisor) {
    match store.list_devices().await {
        Ok(devices) => {
            let mut started = 0;
            for device in &devices {
                if supervisor.ensure_started(device).await {
                    started += 1;
                }
            }
            if started > 0 {
                info!(started, total = devices.len(), "device sessions started");
            }
        },
        Err(e) => warn!(error = %e, "failed to list devices"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::supervisor::{InboundHandler, SupervisorSettings},
        async_trait::async_trait,
        std::time::Duration,
        switchboard_channels::{
            InboundEvent, LoopbackTransport, MemoryCredentialStore, TransportSession,
        },
        switchboard_common::types::Device,
        switchboard_store::InMemoryStore,
    };

    struct Ignore;

    #[async_trait]
    impl InboundHandler for Ignore {
        async fn handle(&self, _: &Device, _: &dyn TransportSession, _: InboundEvent) {}
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            name: id.into(),
            phone_number: "62811".into(),
            admin_number: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn existing_and_new_devices_are_started() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(&device("dev-1")).await.unwrap();
        let transport = LoopbackTransport::auto_connect();
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(Ignore),
            SupervisorSettings::default(),
        );

        let cancel = CancellationToken::new();
        let handle = spawn_device_watch(store.clone(), supervisor.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.insert_device(&device("dev-2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(supervisor.sessions().await, vec!["dev-1".to_string(), "dev-2".to_string()]);
        assert_eq!(transport.connect_count("dev-1"), 1);
        cancel.cancel();
        handle.await.unwrap();
        supervisor.shutdown().await;
    }
}
