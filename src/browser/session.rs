//! Browser session persistence
//!
//! The portal login lives in the browser's storage state (cookies plus local
//! storage). It is created out of band by a human and only carried between
//! runs here; nothing in this crate can log in.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::StoreError;

/// Load/save of a serialized browser session
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Value>, StoreError>;
    fn save(&self, state: &Value) -> Result<(), StoreError>;
}

/// Session kept as a JSON file
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Value>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, state: &Value) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves half a session behind
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
