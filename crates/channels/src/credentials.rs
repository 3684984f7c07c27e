//! Durable per-device session credentials.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::io::AsyncWriteExt,
    tracing::debug,
};

use crate::{Error, Result};

/// Opaque authentication material owned by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, device_id: &str) -> Result<Option<Credentials>>;

    /// Replace the stored credentials. Called on every rotation.
    async fn save(&self, device_id: &str, credentials: &Credentials) -> Result<()>;

    /// Remove the stored credentials. Erasing a missing entry succeeds.
    async fn erase(&self, device_id: &str) -> Result<()>;
}

/// Device ids end up in file names, so only a conservative set is accepted.
fn check_device_id(device_id: &str) -> Result<()> {
    let valid = !device_id.is_empty()
        && device_id.len() <= 128
        && !device_id.starts_with('.')
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_input(format!(
            "device id {device_id:?} is not usable as a credential key"
        )))
    }
}

/// Stores each device's credentials as `<dir>/auth_info_<device_id>.json`.
///
/// Writes go to a temporary file that is synced and renamed into place, so a
/// crash never leaves half-written credentials behind.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, device_id: &str) -> Result<PathBuf> {
        check_device_id(device_id)?;
        Ok(self.dir.join(format!("auth_info_{device_id}.json")))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, device_id: &str) -> Result<Option<Credentials>> {
        let path = self.path_for(device_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, device_id: &str, credentials: &Credentials) -> Result<()> {
        let path = self.path_for(device_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(credentials)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &path).await?;
        debug!(device_id, path = %path.display(), "saved credentials");
        Ok(())
    }

    async fn erase(&self, device_id: &str) -> Result<()> {
        let path = self.path_for(device_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(device_id, "erased credentials");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps credentials in memory. For tests and the loopback transport.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(device_id)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, device_id: &str) -> Result<Option<Credentials>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(device_id).cloned())
    }

    async fn save(&self, device_id: &str, credentials: &Credentials) -> Result<()> {
        check_device_id(device_id)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(device_id.to_string(), credentials.clone());
        Ok(())
    }

    async fn erase(&self, device_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(device_id);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[tokio::test]
    async fn file_store_round_trip_and_erase() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("auth"));

        assert!(store.load("dev-1").await.unwrap().is_none());

        let creds = Credentials(json!({"me": {"id": "62811:3@s.whatsapp.net"}}));
        store.save("dev-1", &creds).await.unwrap();
        assert_eq!(store.load("dev-1").await.unwrap(), Some(creds.clone()));
        assert!(dir.path().join("auth/auth_info_dev-1.json").exists());
        assert!(!dir.path().join("auth/auth_info_dev-1.json.tmp").exists());

        let rotated = Credentials(json!({"me": {"id": "62811:4@s.whatsapp.net"}}));
        store.save("dev-1", &rotated).await.unwrap();
        assert_eq!(store.load("dev-1").await.unwrap(), Some(rotated));

        store.erase("dev-1").await.unwrap();
        assert!(store.load("dev-1").await.unwrap().is_none());
        store.erase("dev-1").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                store.load(bad).await,
                Err(Error::InvalidInput { .. })
            ));
        }
    }

    #[tokio::test]
    async fn memory_store_erase() {
        let store = MemoryCredentialStore::new();
        store.save("d1", &Credentials(json!({"k": 1}))).await.unwrap();
        assert!(store.contains("d1"));
        store.erase("d1").await.unwrap();
        assert!(!store.contains("d1"));
    }
}
