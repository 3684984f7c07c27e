use {
    async_trait::async_trait,
    switchboard_common::types::{
        Conversation, ConversationMode, Device, KnowledgeMatch, Message, MessageStatus,
        NewMessage, StatusRecord,
    },
    tokio::sync::broadcast,
};

use crate::{Result, feed::StoreEvent};

/// The persistent store shared by the supervisor, the inbound pipeline and
/// the outbound dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Devices ─────────────────────────────────────────────────────────────

    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn get_device(&self, id: &str) -> Result<Option<Device>>;
    /// Match on the stored (normalized) phone number.
    async fn find_device_by_phone(&self, phone_number: &str) -> Result<Option<Device>>;
    /// Fails with [`crate::Error::DuplicateDevice`] when the id is taken.
    async fn insert_device(&self, device: &Device) -> Result<()>;

    // ── Conversations ───────────────────────────────────────────────────────

    async fn get_conversation(&self, wa_number: &str) -> Result<Option<Conversation>>;

    /// Create the conversation in bot mode if absent, otherwise bump
    /// `last_active`. An existing name is never replaced; a missing one is
    /// filled from `name`.
    async fn touch_conversation(
        &self,
        wa_number: &str,
        device_id: &str,
        name: Option<&str>,
        at: i64,
    ) -> Result<Conversation>;

    /// Returns `true` when the stored mode changed.
    async fn set_conversation_mode(&self, wa_number: &str, mode: ConversationMode)
    -> Result<bool>;

    // ── Messages ────────────────────────────────────────────────────────────

    async fn insert_message(&self, message: NewMessage) -> Result<Message>;
    async fn get_message(&self, id: i64) -> Result<Option<Message>>;
    /// Newest last.
    async fn list_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Apply a status transition allowed by [`MessageStatus::predecessors`].
    /// Returns `false` (and changes nothing) for any other transition, so a
    /// terminal status is never reverted.
    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<bool>;

    /// Outbound messages still `pending` with an id above `after_id`,
    /// oldest first. Pass the last id of one page to get the next.
    async fn pending_outbound(&self, after_id: i64, limit: usize) -> Result<Vec<Message>>;

    // ── Knowledge ───────────────────────────────────────────────────────────

    async fn insert_knowledge(&self, device_id: &str, content: &str, embedding: &[f32])
    -> Result<i64>;

    /// Chunks of `device_id` only, with similarity strictly above
    /// `threshold`, best first, at most `limit`.
    async fn match_knowledge(
        &self,
        device_id: &str,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<KnowledgeMatch>>;

    // ── Session status ──────────────────────────────────────────────────────

    async fn upsert_status(&self, record: &StatusRecord) -> Result<()>;
    /// Bump `updated_at` only. Returns `false` when no row exists.
    async fn touch_status(&self, device_id: &str, at: i64) -> Result<bool>;
    async fn get_status(&self, device_id: &str) -> Result<Option<StatusRecord>>;

    // ── Settings ────────────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Subscribe to message and device inserts.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
