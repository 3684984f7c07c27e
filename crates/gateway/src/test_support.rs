//! Store double with injectable faults.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    switchboard_common::types::{
        Conversation, ConversationMode, Device, KnowledgeMatch, Message, MessageStatus,
        NewMessage, StatusRecord,
    },
    switchboard_store::{Error, InMemoryStore, Result, Store, StoreEvent},
    tokio::sync::broadcast,
};

/// Wraps an [`InMemoryStore`]: conversation reads can be made to fail, and
/// device records can be swapped without going through an insert.
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    conversation_failures: AtomicUsize,
    devices: Mutex<HashMap<String, Device>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            conversation_failures: AtomicUsize::new(0),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `n` calls to `get_conversation`.
    pub fn fail_conversation_reads(&self, n: usize) {
        self.conversation_failures.store(n, Ordering::SeqCst);
    }

    /// Serve `device` from `get_device` from now on.
    pub fn replace_device(&self, device: Device) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.id.clone(), device);
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.inner.list_devices().await
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let replaced = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        match replaced {
            Some(device) => Ok(Some(device)),
            None => self.inner.get_device(id).await,
        }
    }

    async fn find_device_by_phone(&self, phone_number: &str) -> Result<Option<Device>> {
        self.inner.find_device_by_phone(phone_number).await
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.inner.insert_device(device).await
    }

    async fn get_conversation(&self, wa_number: &str) -> Result<Option<Conversation>> {
        let failing = self
            .conversation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::message("database is locked"));
        }
        self.inner.get_conversation(wa_number).await
    }

    async fn touch_conversation(
        &self,
        wa_number: &str,
        device_id: &str,
        name: Option<&str>,
        at: i64,
    ) -> Result<Conversation> {
        self.inner
            .touch_conversation(wa_number, device_id, name, at)
            .await
    }

    async fn set_conversation_mode(
        &self,
        wa_number: &str,
        mode: ConversationMode,
    ) -> Result<bool> {
        self.inner.set_conversation_mode(wa_number, mode).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.inner.insert_message(message).await
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.inner.get_message(id).await
    }

    async fn list_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.inner.list_messages(conversation_id, limit).await
    }

    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<bool> {
        self.inner.update_message_status(id, status).await
    }

    async fn pending_outbound(&self, after_id: i64, limit: usize) -> Result<Vec<Message>> {
        self.inner.pending_outbound(after_id, limit).await
    }

    async fn insert_knowledge(
        &self,
        device_id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<i64> {
        self.inner
            .insert_knowledge(device_id, content, embedding)
            .await
    }

    async fn match_knowledge(
        &self,
        device_id: &str,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<KnowledgeMatch>> {
        self.inner
            .match_knowledge(device_id, query, threshold, limit)
            .await
    }

    async fn upsert_status(&self, record: &StatusRecord) -> Result<()> {
        self.inner.upsert_status(record).await
    }

    async fn touch_status(&self, device_id: &str, at: i64) -> Result<bool> {
        self.inner.touch_status(device_id, at).await
    }

    async fn get_status(&self, device_id: &str) -> Result<Option<StatusRecord>> {
        self.inner.get_status(device_id).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.inner.set_setting(key, value).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}
