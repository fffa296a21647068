//! Atomic and create-new JSON file persistence.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Atomically write JSON data to a file, replacing any existing content.
///
/// Serializes `data` to pretty-printed JSON, writes a `.tmp` sibling, then
/// renames over the target. Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write JSON to a file that must not exist yet.
///
/// Fails with `io::ErrorKind::AlreadyExists` when the target is present,
/// leaving it untouched. Creates parent directories if they don't exist.
pub fn create_new_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(json.as_bytes()).and_then(|_| file.sync_all()) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("row.json");
        let data = Row {
            name: "valid".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Row> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_create_new_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m1").join("10.json");

        create_new_json(&path, &Row { name: "a".into(), count: 1 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_create_new_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("10.json");
        std::fs::write(&path, b"original").unwrap();

        let err = create_new_json(&path, &Row { name: "b".into(), count: 2 }).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Row>> = load_json(Path::new("/nonexistent/row.json"));
        assert!(result.unwrap().is_none());
    }
}
