use clap::ValueHint;
use serde_json::Value;
use std::path::PathBuf;

use crate::builders::{StatusStore, DEFAULT_STATUS_FILE};
use crate::{print_object, OutputFormat};

/// Status file location.
#[derive(Clone, Debug, clap::Args)]
pub struct StatusArgs {
    /// Status file used to resume interrupted builds.
    #[arg(
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        env = "DEBIMG_STATUS_FILE",
        default_value = DEFAULT_STATUS_FILE
    )]
    pub status_file: PathBuf,
}

impl StatusArgs {
    /// Print stages recorded as done.
    pub fn show(&self, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
        print_object(format, &show(&StatusStore::new(&self.status_file))?)
    }

    /// Delete status file.
    pub fn reset(&self, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
        print_object(format, &reset(&StatusStore::new(&self.status_file))?)
    }
}

fn show(store: &StatusStore) -> Result<Value, Box<dyn std::error::Error>> {
    let snapshot = store.try_load()?.unwrap_or_default();
    Ok(serde_json::json!({
        "status-file": store.path(),
        "stages": snapshot,
    }))
}

fn reset(store: &StatusStore) -> Result<Value, Box<dyn std::error::Error>> {
    let removed = store.reset()?;
    let message = if removed {
        format!("Removed {}", store.path().display())
    } else {
        format!("{} does not exist", store.path().display())
    };
    Ok(serde_json::json!({
        "message": message,
        "removed": removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::{reset, show};
    use crate::builders::StatusStore;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn test_show_and_reset() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = TempDir::new("test-status-cmd")?;
        let path = tmp.path().join(".status");
        let store = StatusStore::new(&path);

        assert_eq!(show(&store)?["stages"], serde_json::json!({}));
        assert_eq!(reset(&store)?["removed"], false);

        fs::write(&path, r#"{"bootstrapped": true, "image-file-created": "a.img"}"#)?;
        let value = show(&store)?;
        assert_eq!(value["stages"]["bootstrapped"], true);
        assert_eq!(value["stages"]["image-file-created"], "a.img");

        assert_eq!(reset(&store)?["removed"], true);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_show_corrupted_status_fails() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = TempDir::new("test-status-cmd")?;
        let path = tmp.path().join(".status");
        fs::write(&path, "[1, 2]")?;
        assert!(show(&StatusStore::new(&path)).is_err());
        Ok(())
    }
}
