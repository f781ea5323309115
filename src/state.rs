//! On-disk record of the active event subscription.
//!
//! The file only says which identifier the last `register` produced. Whether
//! that subscription still exists is decided by the subscriber table, see
//! [`crate::subscription::SubscriptionManager::is_active`].

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    #[serde(rename = "Name")]
    pub identifier: String,
}

impl SubscriptionRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StoreError + use<> {
    let path = path.display().to_string();
    move |source| StoreError::Io {
        action,
        path,
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Read the record back. Missing, unreadable or corrupt files all mean "none".
    pub fn load(&self) -> Option<SubscriptionRecord> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No subscription record at {}", self.path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<SubscriptionRecord>(&s) {
            Ok(rec) if !rec.identifier.trim().is_empty() => Some(rec),
            Ok(_) => {
                tracing::warn!("Ignoring subscription record with empty name");
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse subscription record {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Write through a temp file and rename it over the target.
    pub fn save(&self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        let tmp = self.tmp_path();
        {
            let mut f = fs::File::create(&tmp).map_err(io_err("create", &tmp))?;
            f.write_all(&data).map_err(io_err("write", &tmp))?;
            f.sync_all().ok();
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err("replace", &self.path)(e));
        }
        tracing::debug!("Saved subscription record to {}", self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                action: "remove",
                path: self.path.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"))
    }

    #[test]
    fn save_then_load_returns_record() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&SubscriptionRecord::new("job-7")).unwrap();
        assert_eq!(store.load(), Some(SubscriptionRecord::new("job-7")));
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn record_serializes_with_name_field() {
        let json = serde_json::to_string(&SubscriptionRecord::new("job-1")).unwrap();
        assert_eq!(json, r#"{"Name":"job-1"}"#);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store_in(&dir).load(), None);
    }

    #[test]
    fn corrupt_or_empty_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for content in ["", "{\"Name\": \"job-", "not json", "{\"Name\": \"  \"}", "[]"] {
            fs::write(store.path(), content).unwrap();
            assert_eq!(store.load(), None, "content {content:?}");
        }
    }

    #[test]
    fn save_overwrites_previous_record() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&SubscriptionRecord::new("job-1")).unwrap();
        store.save(&SubscriptionRecord::new("job-2")).unwrap();
        assert_eq!(store.load().unwrap().identifier, "job-2");
    }

    #[test]
    fn leftover_temp_file_is_not_read_as_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.tmp_path(), r#"{"Name":"job-3"}"#).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&SubscriptionRecord::new("job-1")).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nope").join("state.json"));
        let err = store.save(&SubscriptionRecord::new("job-1")).unwrap_err();
        assert!(matches!(err, StoreError::Io { action: "create", .. }));
    }
}
