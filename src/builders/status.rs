//! Persisted pipeline status.
//!
//! The status file is a flat JSON object mapping stage names to completion markers:
//!
//! ```json
//! {"image-file-created": "debian-arm64.img", "partitions-formatted": true}
//! ```
//!
//! A marker is either `true` or a value produced by the stage (like a loop device path).
//! See [`StatusSnapshot`] and [`StatusStore`].

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default name of the status file.
pub const DEFAULT_STATUS_FILE: &str = ".status";

/// Completion marker of a single stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    /// Stage is done (`true`). `false` is accepted when reading and means "not done".
    Flag(bool),

    /// Stage is done and produced a value.
    Value(String),
}

impl StatusValue {
    /// Whether this marker means the stage is done.
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Flag(false))
    }

    /// Produced value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(value) => Some(value.as_str()),
            Self::Flag(_) => None,
        }
    }
}

impl From<String> for StatusValue {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

/// Mapping of stage names to completion markers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusSnapshot(BTreeMap<String, StatusValue>);

impl StatusSnapshot {
    /// New empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether stage `key` is recorded as done.
    pub fn is_done(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(StatusValue::is_done)
    }

    /// Marker of stage `key`.
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.0.get(key)
    }

    /// Whether there is any marker for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Record marker for stage `key`, replacing the previous one.
    pub fn insert<V>(&mut self, key: &str, value: V)
    where
        V: Into<StatusValue>,
    {
        self.0.insert(key.to_string(), value.into());
    }

    /// Record stage `key` as done without a value.
    pub fn mark_done(&mut self, key: &str) {
        self.0.insert(key.to_string(), StatusValue::Flag(true));
    }

    /// Remove marker of stage `key`.
    pub fn remove(&mut self, key: &str) -> Option<StatusValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for StatusSnapshot
where
    K: Into<String>,
    V: Into<StatusValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl From<bool> for StatusValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Error in [`StatusStore`].
#[derive(Error, Debug)]
pub enum StatusError {
    /// Failed to read status file.
    #[error("failed to read status file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Status file content is not valid JSON.
    #[error("status file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Status file is valid JSON, but not a mapping of stage markers.
    #[error("status file {path} is corrupted: {message}")]
    Corrupted { path: PathBuf, message: String },

    /// Failed to serialize snapshot.
    #[error("failed to serialize status: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Failed to write status file.
    #[error("failed to write status file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    /// Failed to delete status file.
    #[error("failed to delete status file {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Status file handler.
///
/// Assumes a single pipeline instance per status file. No locking is performed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path to status file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Load snapshot from status file.
    ///
    /// Never fails: missing, unreadable or corrupted status files result in an empty snapshot.
    pub fn load(&self) -> StatusSnapshot {
        match self.try_load() {
            Ok(Some(snapshot)) => {
                debug!(
                    "loaded status from {} ({} entries)",
                    self.path.display(),
                    snapshot.len()
                );
                snapshot
            }
            Ok(None) => {
                info!("no status file at {}, starting from scratch", self.path.display());
                StatusSnapshot::new()
            }
            Err(err) => {
                warn!("{}, starting over", err);
                StatusSnapshot::new()
            }
        }
    }

    /// Load snapshot returning `None` if status file doesn't exist.
    pub fn try_load(&self) -> Result<Option<StatusSnapshot>, StatusError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| StatusError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if !value.is_object() {
            return Err(StatusError::Corrupted {
                path: self.path.clone(),
                message: "top-level value is not a mapping".to_string(),
            });
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| StatusError::Corrupted {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }

    /// Write snapshot to status file.
    ///
    /// Failure is logged and returned.
    pub fn save(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        let result = serde_json::to_string_pretty(snapshot)
            .map_err(StatusError::Serialize)
            .and_then(|content| {
                fs::write(&self.path, content).map_err(|source| StatusError::Write {
                    path: self.path.clone(),
                    source,
                })
            });
        match &result {
            Ok(()) => debug!(
                "saved status to {} ({} entries)",
                self.path.display(),
                snapshot.len()
            ),
            Err(err) => error!("{}", err),
        }
        result
    }

    /// Delete status file. Returns `false` if there was nothing to delete.
    pub fn reset(&self) -> Result<bool, StatusError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StatusError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StatusError, StatusSnapshot, StatusStore, StatusValue};
    use anyhow::Result;
    use std::fs;
    use tempdir::TempDir;

    fn store_with(content: &str) -> Result<(TempDir, StatusStore)> {
        let tmp = TempDir::new("test-status")?;
        let path = tmp.path().join(".status");
        fs::write(&path, content)?;
        Ok((tmp, StatusStore::new(path)))
    }

    #[test]
    fn test_load_missing_file() -> Result<()> {
        let tmp = TempDir::new("test-status")?;
        let store = StatusStore::new(tmp.path().join(".status"));
        assert!(store.try_load()?.is_none());
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn test_load_mixed_markers() -> Result<()> {
        let (_tmp, store) =
            store_with(r#"{"image-file-created": "test.img", "partitions-formatted": true}"#)?;
        let snapshot = store.load();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.is_done("partitions-formatted"));
        assert_eq!(
            snapshot.get("image-file-created"),
            Some(&StatusValue::Value("test.img".to_string()))
        );
        Ok(())
    }

    #[test]
    fn test_false_flag_is_not_done() -> Result<()> {
        let (_tmp, store) = store_with(r#"{"bootstrapped": false}"#)?;
        let snapshot = store.load();
        assert!(snapshot.contains("bootstrapped"));
        assert!(!snapshot.is_done("bootstrapped"));
        Ok(())
    }

    #[test]
    fn test_load_list_is_corrupted() -> Result<()> {
        let (_tmp, store) = store_with(r#"["image-file-created", "bootstrapped"]"#)?;
        assert!(matches!(
            store.try_load(),
            Err(StatusError::Corrupted { .. })
        ));
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn test_load_garbage_is_corrupted() -> Result<()> {
        let (_tmp, store) = store_with("{not json at all")?;
        assert!(matches!(store.try_load(), Err(StatusError::Parse { .. })));
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn test_load_nested_value_is_corrupted() -> Result<()> {
        let (_tmp, store) = store_with(r#"{"loop-device-attached": {"path": "/dev/loop0"}}"#)?;
        assert!(matches!(
            store.try_load(),
            Err(StatusError::Corrupted { .. })
        ));
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn test_save_writes_flat_mapping() -> Result<()> {
        let tmp = TempDir::new("test-status")?;
        let store = StatusStore::new(tmp.path().join(".status"));
        let snapshot: StatusSnapshot = [
            ("image-file-created", StatusValue::from("disk.img")),
            ("bootstrapped", StatusValue::from(true)),
        ]
        .into_iter()
        .collect();
        store.save(&snapshot)?;

        let content = fs::read_to_string(store.path())?;
        assert_eq!(
            content,
            "{\n  \"bootstrapped\": true,\n  \"image-file-created\": \"disk.img\"\n}"
        );
        let raw: serde_json::Value = serde_json::from_str(&content)?;
        assert_eq!(
            raw,
            serde_json::json!({"image-file-created": "disk.img", "bootstrapped": true})
        );
        assert_eq!(store.load(), snapshot);
        Ok(())
    }

    #[test]
    fn test_save_to_missing_directory_fails() -> Result<()> {
        let tmp = TempDir::new("test-status")?;
        let store = StatusStore::new(tmp.path().join("no-such-dir").join(".status"));
        let result = store.save(&StatusSnapshot::new());
        assert!(matches!(result, Err(StatusError::Write { .. })));
        Ok(())
    }

    #[test]
    fn test_reset() -> Result<()> {
        let (_tmp, store) = store_with("{}")?;
        assert!(store.reset()?);
        assert!(!store.path().exists());
        assert!(!store.reset()?);
        Ok(())
    }
}
