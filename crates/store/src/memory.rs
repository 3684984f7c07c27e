//! In-memory store for tests and local demos. Nothing is persisted.

use std::{collections::HashMap, sync::Mutex};

use {
    async_trait::async_trait,
    switchboard_common::{
        now_ms,
        types::{
            Conversation, ConversationMode, Device, KnowledgeMatch, Message, MessageStatus,
            NewMessage, StatusRecord,
        },
    },
    tokio::sync::broadcast,
};

use crate::{
    Error, Result,
    feed::{ChangeFeed, StoreEvent},
    store::Store,
    vector,
};

struct KnowledgeRow {
    id: i64,
    device_id: String,
    content: String,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Tables {
    devices: Vec<Device>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    knowledge: Vec<KnowledgeRow>,
    status: HashMap<String, StatusRecord>,
    settings: HashMap<String, serde_json::Value>,
    next_message_id: i64,
    next_knowledge_id: i64,
}

pub struct InMemoryStore {
    tables: Mutex<Tables>,
    feed: ChangeFeed,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            feed: ChangeFeed::default(),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.tables().devices.clone())
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.tables().devices.iter().find(|d| d.id == id).cloned())
    }

    async fn find_device_by_phone(&self, phone_number: &str) -> Result<Option<Device>> {
        Ok(self
            .tables()
            .devices
            .iter()
            .find(|d| d.phone_number == phone_number)
            .cloned())
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        let mut device = device.clone();
        {
            let mut t = self.tables();
            if t.devices.iter().any(|d| d.id == device.id) {
                return Err(Error::DuplicateDevice {
                    device_id: device.id,
                });
            }
            if device.created_at == 0 {
                device.created_at = now_ms();
            }
            t.devices.push(device.clone());
        }
        self.feed.publish(StoreEvent::DeviceInserted(device));
        Ok(())
    }

    async fn get_conversation(&self, wa_number: &str) -> Result<Option<Conversation>> {
        Ok(self.tables().conversations.get(wa_number).cloned())
    }

    async fn touch_conversation(
        &self,
        wa_number: &str,
        device_id: &str,
        name: Option<&str>,
        at: i64,
    ) -> Result<Conversation> {
        let mut t = self.tables();
        let conv = t
            .conversations
            .entry(wa_number.to_string())
            .or_insert_with(|| Conversation {
                wa_number: wa_number.to_string(),
                device_id: device_id.to_string(),
                name: None,
                mode: ConversationMode::Bot,
                last_active: at,
            });
        conv.last_active = at;
        if conv.name.is_none() {
            conv.name = name.map(str::to_string);
        }
        Ok(conv.clone())
    }

    async fn set_conversation_mode(
        &self,
        wa_number: &str,
        mode: ConversationMode,
    ) -> Result<bool> {
        let mut t = self.tables();
        match t.conversations.get_mut(wa_number) {
            Some(conv) if conv.mode != mode => {
                conv.mode = mode;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let stored = {
            let mut t = self.tables();
            t.next_message_id += 1;
            let stored = Message {
                id: t.next_message_id,
                conversation_id: message.conversation_id,
                text: message.text,
                direction: message.direction,
                status: message.status,
                created_at: now_ms(),
            };
            t.messages.push(stored.clone());
            stored
        };
        self.feed.publish(StoreEvent::MessageInserted(stored.clone()));
        Ok(stored)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        Ok(self.tables().messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let t = self.tables();
        let all: Vec<Message> = t
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<bool> {
        let mut t = self.tables();
        match t.messages.iter_mut().find(|m| m.id == id) {
            Some(msg) if msg.status.can_become(status) => {
                msg.status = status;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn pending_outbound(&self, after_id: i64, limit: usize) -> Result<Vec<Message>> {
        Ok(self
            .tables()
            .messages
            .iter()
            .filter(|m| m.id > after_id && m.is_pending_outbound())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_knowledge(
        &self,
        device_id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<i64> {
        let mut t = self.tables();
        t.next_knowledge_id += 1;
        let id = t.next_knowledge_id;
        t.knowledge.push(KnowledgeRow {
            id,
            device_id: device_id.to_string(),
            content: content.to_string(),
            embedding: embedding.to_vec(),
        });
        Ok(id)
    }

    async fn match_knowledge(
        &self,
        device_id: &str,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<KnowledgeMatch>> {
        let t = self.tables();
        let candidates = t
            .knowledge
            .iter()
            .filter(|k| k.device_id == device_id)
            .map(|k| (k.id, k.content.clone(), k.embedding.clone()));
        Ok(vector::rank(candidates, query, threshold, limit))
    }

    async fn upsert_status(&self, record: &StatusRecord) -> Result<()> {
        self.tables()
            .status
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn touch_status(&self, device_id: &str, at: i64) -> Result<bool> {
        let mut t = self.tables();
        Ok(t
            .status
            .get_mut(device_id)
            .map(|r| r.updated_at = at)
            .is_some())
    }

    async fn get_status(&self, device_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.tables().status.get(device_id).cloned())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.tables().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.tables()
            .settings
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.feed.subscribe()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, switchboard_common::types::MessageDirection};

    fn device(id: &str, phone: &str) -> Device {
        Device {
            id: id.into(),
            name: format!("Device {id}"),
            phone_number: phone.into(),
            admin_number: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn knowledge_is_scoped_to_device() {
        let store = InMemoryStore::new();
        store.insert_knowledge("d1", "d1 hours", &[0.8, 0.6]).await.unwrap();
        store.insert_knowledge("d2", "d2 hours", &[1.0, 0.0]).await.unwrap();

        let hits = store.match_knowledge("d1", &[1.0, 0.0], 0.5, 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "d1 hours");
    }

    #[tokio::test]
    async fn inserts_are_published() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe();
        store.insert_device(&device("d1", "62811")).await.unwrap();
        store
            .insert_message(NewMessage::outbound("62822", "hello", MessageStatus::Pending))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::DeviceInserted(d) if d.id == "d1"));
        match rx.recv().await.unwrap() {
            StoreEvent::MessageInserted(m) => {
                assert!(m.is_pending_outbound());
                assert_eq!(m.direction, MessageDirection::Outbound);
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_device_is_rejected() {
        let store = InMemoryStore::new();
        store.insert_device(&device("d1", "62811")).await.unwrap();
        let err = store.insert_device(&device("d1", "62899")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice { .. }));
    }

    #[tokio::test]
    async fn touch_keeps_existing_name_and_mode() {
        let store = InMemoryStore::new();
        store
            .touch_conversation("62822", "d1", Some("Budi"), 10)
            .await
            .unwrap();
        store
            .set_conversation_mode("62822", ConversationMode::Agent)
            .await
            .unwrap();
        let conv = store
            .touch_conversation("62822", "d1", None, 20)
            .await
            .unwrap();
        assert_eq!(conv.name.as_deref(), Some("Budi"));
        assert_eq!(conv.mode, ConversationMode::Agent);
        assert_eq!(conv.last_active, 20);
    }
}
