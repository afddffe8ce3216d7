//! Atomic JSON file persistence.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{P2pError, P2pResult};

/// Serialize `value` as pretty JSON, check that it parses back, and write it
/// to `path` through a temporary file and a rename.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> P2pResult<()> {
    let contents = serde_json::to_string_pretty(value)?;

    // Never replace a good file with text that does not parse.
    serde_json::from_str::<serde_json::Value>(&contents)
        .map_err(|e| P2pError::Serialization(format!("refusing to write invalid JSON: {}", e)))?;

    write_atomic(path, contents.as_bytes()).await
}

/// Read and parse a JSON file, returning `None` when it does not exist.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> P2pResult<Option<T>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let value = serde_json::from_str(&contents).map_err(|e| {
        P2pError::Serialization(format!("failed to parse {}: {}", path.display(), e))
    })?;

    Ok(Some(value))
}

/// Write bytes to `path` atomically.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> P2pResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = temp_path_for(path);

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;

    tracing::trace!(path = ?path, bytes = contents.len(), "Wrote file");

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        save_json(&path, &json!({ "peers": ["a:1"] })).await.unwrap();

        let loaded: serde_json::Value = load_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded["peers"][0], "a:1");
        assert!(!temp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        let loaded: Option<serde_json::Value> =
            load_json(&dir.path().join("missing.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result: P2pResult<Option<serde_json::Value>> = load_json(&path).await;
        assert!(matches!(result, Err(P2pError::Serialization(_))));
    }
}
