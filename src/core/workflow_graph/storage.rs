use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Characters left readable in on-disk names.
const FILE_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        AppError::with_source(ErrorCategory::IoError, message, Box::new(err)).with_code("GRF-STORE-001")
    }
}

/// Persistence contract shared by checkpoints and metrics.
///
/// Entries are addressed by `(namespace, key)`; `list` returns keys sorted.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn save(&self, namespace: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Returns whether an entry was removed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;
    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError>;
    /// Namespaces holding at least one entry, sorted.
    async fn namespaces(&self) -> Result<Vec<String>, StorageError>;
}

/// Process-local backend.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save(&self, namespace: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        let Some(entries) = data.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = entries.remove(key).is_some();
        if entries.is_empty() {
            data.remove(namespace);
        }
        Ok(removed)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.read().await.keys().cloned().collect())
    }
}

/// Directory-backed storage: `<root>/<namespace>/<key>.json`, written atomically.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(encode(namespace)?))
    }

    fn entry_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{}.json", encode(key)?)))
    }
}

fn encode(name: &str) -> Result<String, StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidKey("empty name".to_string()));
    }
    let encoded = utf8_percent_encode(name, FILE_SAFE).to_string();
    if encoded == "." || encoded == ".." {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(encoded)
}

fn decode(name: &str) -> Option<String> {
    percent_decode_str(name)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(parent, err))?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|err| io_error(&tmp_path, err))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|err| io_error(path, err))?;
    Ok(())
}

async fn read_dir_names(dir: &Path, want_dirs: bool) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(io_error(dir, err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| io_error(dir, err))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if is_dir != want_dirs {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn save(&self, namespace: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.entry_path(namespace, key)?;
        atomic_write(&path, &bytes).await
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.entry_path(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.entry_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.namespace_dir(namespace)?;
        let mut keys: Vec<String> = read_dir_names(&dir, false)
            .await?
            .into_iter()
            .filter_map(|name| name.strip_suffix(".json").and_then(decode))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut namespaces: Vec<String> = read_dir_names(&self.root, true)
            .await?
            .into_iter()
            .filter_map(|name| decode(&name))
            .collect();
        namespaces.sort();
        Ok(namespaces)
    }
}
