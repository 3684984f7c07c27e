//! SQLite-backed store using sqlx.
//!
//! The change feed is driven by a watermark poller so rows written by other
//! processes (the dashboard) are published exactly like local inserts.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
    switchboard_common::{
        now_ms,
        types::{
            Conversation, ConversationMode, Device, KnowledgeMatch, Message, MessageStatus,
            NewMessage, StatusRecord,
        },
    },
    tokio::sync::{Mutex, Notify, broadcast},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    feed::{ChangeFeed, StoreEvent},
    store::Store,
    vector,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, message, direction, status, created_at";
const POLL_BATCH: i64 = 500;

/// Highest rowids already published.
#[derive(Debug, Default, Clone, Copy)]
struct Watermarks {
    message_id: i64,
    device_rowid: i64,
}

pub struct SqliteStore {
    pool: SqlitePool,
    feed: ChangeFeed,
    watermarks: Mutex<Watermarks>,
    wake: Notify,
}

impl SqliteStore {
    /// Wrap an existing pool (migrations must already be run).
    ///
    /// Rows present at this point are treated as already published.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let message_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM messages")
            .fetch_one(&pool)
            .await?;
        let device_rowid: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(rowid), 0) FROM devices")
            .fetch_one(&pool)
            .await?;
        Ok(Self {
            pool,
            feed: ChangeFeed::default(),
            watermarks: Mutex::new(Watermarks {
                message_id,
                device_rowid,
            }),
            wake: Notify::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Publish rows inserted since the last poll. Returns how many events
    /// were published.
    pub async fn poll_changes(&self) -> Result<usize> {
        let mut marks = self.watermarks.lock().await;
        let mut published = 0;

        let device_rows = sqlx::query(
            "SELECT rowid, id, name, phone_number, admin_number, created_at
             FROM devices WHERE rowid > ? ORDER BY rowid LIMIT ?",
        )
        .bind(marks.device_rowid)
        .bind(POLL_BATCH)
        .fetch_all(&self.pool)
        .await?;
        for row in &device_rows {
            marks.device_rowid = row.try_get("rowid")?;
            self.feed
                .publish(StoreEvent::DeviceInserted(device_from_row(row)?));
            published += 1;
        }

        let message_rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id > ? ORDER BY id LIMIT ?"
        ))
        .bind(marks.message_id)
        .bind(POLL_BATCH)
        .fetch_all(&self.pool)
        .await?;
        for row in &message_rows {
            let message = message_from_row(row)?;
            marks.message_id = message.id;
            self.feed.publish(StoreEvent::MessageInserted(message));
            published += 1;
        }

        Ok(published)
    }

    /// Poll for changes every `interval`, or sooner after a local insert,
    /// until `cancel` fires.
    pub fn spawn_change_poller(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {},
                    _ = store.wake.notified() => {},
                }
                match store.poll_changes().await {
                    Ok(0) => {},
                    Ok(n) => debug!(events = n, "published store changes"),
                    Err(e) => warn!(error = %e, "change feed poll failed"),
                }
            }
            debug!("change poller stopped");
        })
    }
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    Ok(Device {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone_number: row.try_get("phone_number")?,
        admin_number: row.try_get("admin_number")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let mode: String = row.try_get("mode")?;
    Ok(Conversation {
        wa_number: row.try_get("wa_number")?,
        device_id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        mode: mode
            .parse()
            .map_err(|e| Error::corrupt("conversations", e))?,
        last_active: row.try_get("last_active")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        text: row.try_get("message")?,
        direction: direction
            .parse()
            .map_err(|e| Error::corrupt("messages", e))?,
        status: status.parse().map_err(|e| Error::corrupt("messages", e))?,
        created_at: row.try_get("created_at")?,
    })
}

fn status_from_row(row: &SqliteRow) -> Result<StatusRecord> {
    let status: String = row.try_get("status")?;
    Ok(StatusRecord {
        id: row.try_get("id")?,
        status: status
            .parse()
            .map_err(|e| Error::corrupt("system_status", e))?,
        qr_code: row.try_get("qr_code")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT id, name, phone_number, admin_number, created_at FROM devices ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, phone_number, admin_number, created_at FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn find_device_by_phone(&self, phone_number: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, phone_number, admin_number, created_at
             FROM devices WHERE phone_number = ? ORDER BY rowid LIMIT 1",
        )
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        let created_at = if device.created_at == 0 {
            now_ms()
        } else {
            device.created_at
        };
        sqlx::query(
            "INSERT INTO devices (id, name, phone_number, admin_number, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.phone_number)
        .bind(&device.admin_number)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateDevice {
                    device_id: device.id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        self.wake.notify_one();
        Ok(())
    }

    async fn get_conversation(&self, wa_number: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT wa_number, device_id, name, mode, last_active
             FROM conversations WHERE wa_number = ?",
        )
        .bind(wa_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn touch_conversation(
        &self,
        wa_number: &str,
        device_id: &str,
        name: Option<&str>,
        at: i64,
    ) -> Result<Conversation> {
        let row = sqlx::query(
            "INSERT INTO conversations (wa_number, device_id, name, mode, last_active)
             VALUES (?, ?, ?, 'bot', ?)
             ON CONFLICT(wa_number) DO UPDATE SET
                 last_active = excluded.last_active,
                 name = COALESCE(conversations.name, excluded.name)
             RETURNING wa_number, device_id, name, mode, last_active",
        )
        .bind(wa_number)
        .bind(device_id)
        .bind(name)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        conversation_from_row(&row)
    }

    async fn set_conversation_mode(
        &self,
        wa_number: &str,
        mode: ConversationMode,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET mode = ?, last_active = ? WHERE wa_number = ? AND mode != ?",
        )
        .bind(mode.as_str())
        .bind(now_ms())
        .bind(wa_number)
        .bind(mode.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages (conversation_id, message, direction, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(&message.conversation_id)
        .bind(&message.text)
        .bind(message.direction.as_str())
        .bind(message.status.as_str())
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        self.wake.notify_one();
        message_from_row(&row)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id"
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<bool> {
        let from = status.predecessors();
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql =
            format!("UPDATE messages SET status = ? WHERE id = ? AND status IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(status.as_str()).bind(id);
        for prev in from {
            query = query.bind(prev.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_outbound(&self, after_id: i64, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE status = 'pending' AND direction = 'outbound' AND id > ?
             ORDER BY id LIMIT ?"
        ))
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn insert_knowledge(
        &self,
        device_id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO knowledge_base (device_id, content, embedding, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(device_id)
        .bind(content)
        .bind(vector::vec_to_blob(embedding))
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn match_knowledge(
        &self,
        device_id: &str,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<KnowledgeMatch>> {
        let rows = sqlx::query(
            "SELECT id, content, embedding FROM knowledge_base WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            candidates.push((
                row.try_get::<i64, _>("id")?,
                row.try_get::<String, _>("content")?,
                vector::blob_to_vec(&blob),
            ));
        }
        Ok(vector::rank(candidates, query, threshold, limit))
    }

    async fn upsert_status(&self, record: &StatusRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_status (id, status, qr_code, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 qr_code = excluded.qr_code,
                 updated_at = excluded.updated_at",
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(&record.qr_code)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_status(&self, device_id: &str, at: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE system_status SET updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_status(&self, device_id: &str) -> Result<Option<StatusRecord>> {
        let row =
            sqlx::query("SELECT id, status, qr_code, updated_at FROM system_status WHERE id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(status_from_row).transpose()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.feed.subscribe()
    }
}
