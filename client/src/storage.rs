use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Check if the app is running in portable mode
pub fn is_portable_mode() -> bool {
    portable_data_dir().is_some()
}

/// Directory for persisted client data.
///
/// Portable installs (a `portable.txt` next to the executable) keep data in
/// `data/` beside the binary; everything else uses the platform data dir.
pub fn data_directory() -> PathBuf {
    portable_data_dir()
        .or_else(|| {
            ProjectDirs::from("com", "watchparty", "WatchParty")
                .map(|dirs| dirs.data_dir().to_path_buf())
        })
        .unwrap_or_else(env::temp_dir)
}

fn portable_data_dir() -> Option<PathBuf> {
    let exe_path = env::current_exe().ok()?;
    let exe_dir = exe_path.parent()?;
    exe_dir
        .join("portable.txt")
        .exists()
        .then(|| exe_dir.join("data"))
}

/// A single JSON document on disk with an in-memory copy
pub struct JsonFile<T> {
    path: PathBuf,
    cached: Mutex<Option<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> JsonFile<T> {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = Self::read_from_disk(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn load(&self) -> Option<T> {
        self.cached.lock().clone()
    }

    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        *self.cached.lock() = Some(value.clone());
        Ok(())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
        *self.cached.lock() = None;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_from_disk(path: &Path) -> Option<T> {
        let data = fs::read(path).ok()?;
        serde_json::from_slice(&data)
            .inspect_err(|e| tracing::warn!("Ignoring unreadable {}: {}", path.display(), e))
            .ok()
    }
}

/// Room membership we can resume after a reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub room_id: String,
    pub resume_token: String,
    pub is_host: bool,
}

pub type SessionStore = JsonFile<PersistedSession>;

impl SessionStore {
    pub fn default_location() -> Self {
        Self::open(data_directory().join("session.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let session = PersistedSession {
            room_id: "123-456".into(),
            resume_token: "token".into(),
            is_host: true,
        };

        let store = SessionStore::open(&path);
        assert_eq!(store.load(), None);
        store.save(&session).unwrap();

        let reopened = SessionStore::open(&path);
        assert_eq!(reopened.load(), Some(session));
        reopened.clear();
        assert!(!path.exists());
        assert_eq!(SessionStore::open(&path).load(), None);
    }

    #[test]
    fn corrupt_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(SessionStore::open(&path).load(), None);
    }
}
