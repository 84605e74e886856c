//! Where a client remembers which session it was attached to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::ClientError;

/// Session ids keyed by a caller-chosen logical name ("main-terminal").
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, ClientError>;
    fn save(&self, key: &str, session_id: &str) -> Result<(), ClientError>;
    fn forget(&self, key: &str) -> Result<(), ClientError>;
}

/// Per-process store; ids are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ids: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, ClientError> {
        let ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ids.get(key).cloned())
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), ClientError> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(key.to_string(), session_id.to_string());
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<(), ClientError> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(key);
        Ok(())
    }
}

/// Ids persisted as a JSON object in a single file, so a restarted client
/// resumes where it left off.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/relayterm/sessions.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("relayterm").join("sessions.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, ClientError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ClientError::Store(e)),
        }
    }

    fn write_all(&self, ids: &HashMap<String, String>) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ClientError::Store)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(ids)?).map_err(ClientError::Store)?;
        std::fs::rename(&tmp, &self.path).map_err(ClientError::Store)?;
        debug!("Saved {} session ids to {}", ids.len(), self.path.display());
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), ClientError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids = self.read_all()?;
        f(&mut ids);
        self.write_all(&ids)
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<String>, ClientError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.remove(key))
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), ClientError> {
        self.update(|ids| {
            ids.insert(key.to_string(), session_id.to_string());
        })
    }

    fn forget(&self, key: &str) -> Result<(), ClientError> {
        self.update(|ids| {
            ids.remove(key);
        })
    }
}
