//! Persistence for devices, conversations, messages, knowledge chunks and
//! session status, plus the change feed the dispatcher and supervisor
//! subscribe to.

pub mod error;
pub mod feed;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod vector;

pub use {
    error::{Error, Result},
    feed::{ChangeFeed, StoreEvent},
    memory::InMemoryStore,
    sqlite::SqliteStore,
    store::Store,
};

/// Setting key for the global auto-reply switch (JSON bool).
pub const AI_ENABLED_SETTING: &str = "ai_enabled";

/// Run database migrations for the switchboard schema.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
