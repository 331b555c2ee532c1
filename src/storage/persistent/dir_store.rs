//! One-file-per-key store.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::codec;
use crate::storage::traits::{KeyValueStore, StorageError};

const ENTRY_EXT: &str = "entry";
const MAX_KEY_LEN: usize = 200;

/// A `KeyValueStore` keeping each entry in its own checksummed file.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    sync_on_write: bool,
}

impl DirectoryStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    /// `StorageError::Unavailable` if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::Unavailable(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            sync_on_write: true,
        })
    }

    /// Skips `fsync` after writes. Faster, but a crash may lose recent entries.
    #[must_use]
    pub const fn without_sync(mut self) -> Self {
        self.sync_on_write = false;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{}.{ENTRY_EXT}", encode_file_name(key))))
    }
}

/// Keeps `[A-Za-z0-9._-]`, escapes everything else as `%XX`.
fn encode_file_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn io_error(err: &std::io::Error, action: &str, path: &Path) -> StorageError {
    let message = format!("{action} {}: {err}", path.display());
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::NotFound => StorageError::Unavailable(message),
        _ => StorageError::BackendError(message),
    }
}

impl KeyValueStore for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&err, "read", &path)),
        };
        let (stored_key, value) = codec::decode(&bytes).map_err(|e| StorageError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if stored_key != key {
            return Err(StorageError::Corrupted {
                key: key.to_string(),
                reason: format!("file holds key '{stored_key}'"),
            });
        }
        Ok(Some(value))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let final_path = self.path_for(key)?;
        let bytes = codec::encode(key, value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let temp_path = final_path.with_extension(format!("{ENTRY_EXT}.tmp.{}", Uuid::new_v4().simple()));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
            fs::rename(&temp_path, &final_path)
        };
        write().map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            io_error(&err, "write", &final_path)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&err, "delete", &path)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let dir = fs::read_dir(&self.root).map_err(|e| io_error(&e, "list", &self.root))?;
        let mut keys = Vec::new();
        for entry in dir {
            let path = entry.map_err(|e| io_error(&e, "list", &self.root))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            // The key is read from the frame, not decoded from the file name.
            let Ok(bytes) = fs::read(&path) else { continue };
            if let Ok((key, _)) = codec::decode(&bytes) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_put_get_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = DirectoryStore::open(dir.path()).unwrap();
            store.put("kb:theory-core:ab12", b"compiled").unwrap();
        }
        let store = DirectoryStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("kb:theory-core:ab12").unwrap().as_deref(),
            Some(&b"compiled"[..])
        );
        assert_eq!(store.get("kb:theory-core:ffff").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec!["kb:theory-core:ab12".to_string()]);
    }

    #[test]
    fn test_corrupted_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap().without_sync();
        store.put("k", b"value").unwrap();
        let path = store.path_for("k").unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(store.get("k"), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn test_concurrent_writers_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryStore::open(dir.path()).unwrap().without_sync());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..10 {
                        store.put("shared", format!("writer-{i}").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let value = String::from_utf8(store.get("shared").unwrap().unwrap()).unwrap();
        assert!(value.starts_with("writer-"));
        // No temp files are left behind.
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_delete_and_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.put("a/b", b"x").unwrap();
        assert!(store.delete("a/b").unwrap());
        assert!(!store.delete("a/b").unwrap());
        assert!(matches!(store.put("", b"x"), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_file_names_are_escaped() {
        assert_eq!(encode_file_name("kb:m:1.0"), "kb%3Am%3A1.0");
    }
}
