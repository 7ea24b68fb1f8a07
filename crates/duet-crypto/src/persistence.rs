//! Local durable storage for the device keypair.
//!
//! The file store is a small JSON key-value document. The keypair lives under
//! [`KEYPAIR_STORAGE_KEY`]; any other keys in the document are preserved on
//! write. A missing file or key means "no keys yet". Anything unreadable is
//! a [`CryptoError::KeyStorage`] error and is never papered over with a fresh
//! key, since that would silently change the device identity.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CryptoError;
use crate::identity::{KeyPair, StoredKeyPair};

/// Fixed logical key under which the keypair is stored.
pub const KEYPAIR_STORAGE_KEY: &str = "duet.keypair";

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the device keypair, `None` if none was persisted yet.
    async fn load(&self) -> Result<Option<KeyPair>, CryptoError>;

    /// Persist the device keypair, replacing any previous one.
    async fn persist(&self, pair: &KeyPair) -> Result<(), CryptoError>;
}

/// Load the device keypair, generating and persisting one on first run.
pub async fn load_or_generate(store: &dyn KeyStore) -> Result<KeyPair, CryptoError> {
    if let Some(pair) = store.load().await? {
        debug!("loaded device keypair");
        return Ok(pair);
    }
    let pair = KeyPair::generate();
    store.persist(&pair).await?;
    info!(public_key = %pair.public_key_base64(), "generated new device keypair");
    Ok(pair)
}

/// Keypair stored in a JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Option<Map<String, Value>>, CryptoError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CryptoError::KeyStorage(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let document: Map<String, Value> = serde_json::from_str(&content).map_err(|e| {
            CryptoError::KeyStorage(format!("corrupt key file {}: {e}", self.path.display()))
        })?;
        Ok(Some(document))
    }

    /// Unique sibling of the key file, so concurrent writers never share one.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "keys".into());
        self.path
            .with_file_name(format!(".{name}.{:016x}.tmp", rand::random::<u64>()))
    }
}

/// Create `path` readable by the owner only and write `content` to it.
async fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

fn storage_err(path: &Path, action: &str, e: std::io::Error) -> CryptoError {
    CryptoError::KeyStorage(format!("failed to {action} {}: {e}", path.display()))
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self) -> Result<Option<KeyPair>, CryptoError> {
        let Some(mut document) = self.read_document().await? else {
            return Ok(None);
        };
        let Some(value) = document.remove(KEYPAIR_STORAGE_KEY) else {
            return Ok(None);
        };
        let stored: StoredKeyPair = serde_json::from_value(value).map_err(|e| {
            CryptoError::KeyStorage(format!("corrupt keypair entry: {e}"))
        })?;
        KeyPair::from_stored(&stored).map(Some)
    }

    async fn persist(&self, pair: &KeyPair) -> Result<(), CryptoError> {
        let mut document = self.read_document().await?.unwrap_or_default();
        let entry = serde_json::to_value(pair.to_stored())
            .map_err(|e| CryptoError::KeyStorage(format!("failed to encode keypair: {e}")))?;
        document.insert(KEYPAIR_STORAGE_KEY.to_string(), entry);
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| CryptoError::KeyStorage(format!("failed to encode key file: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(parent, "create", e))?;
        }

        // Write next to the target and rename so a crash never leaves a half-written key.
        let tmp_path = self.temp_path();
        if let Err(e) = write_private(&tmp_path, &content).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(storage_err(&tmp_path, "write", e));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(storage_err(&self.path, "replace", e));
        }

        debug!(path = %self.path.display(), "persisted device keypair");
        Ok(())
    }
}

/// Keypair held in process memory only.
#[derive(Default)]
pub struct MemoryKeyStore {
    slot: Mutex<Option<StoredKeyPair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: &KeyPair) -> Self {
        Self {
            slot: Mutex::new(Some(pair.to_stored())),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Option<KeyPair>, CryptoError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| CryptoError::KeyStorage("key store lock poisoned".into()))?;
        slot.as_ref().map(KeyPair::from_stored).transpose()
    }

    async fn persist(&self, pair: &KeyPair) -> Result<(), CryptoError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CryptoError::KeyStorage("key store lock poisoned".into()))?;
        *slot = Some(pair.to_stored());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_means_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("nested").join("keys.json"));
        let pair = KeyPair::generate();
        store.persist(&pair).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.public_key_bytes(), pair.public_key_bytes());
    }

    #[tokio::test]
    async fn file_layout_and_other_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

        let store = FileKeyStore::new(&path);
        store.persist(&KeyPair::generate()).await.unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["theme"], "dark");
        assert_eq!(doc[KEYPAIR_STORAGE_KEY]["publicKey"].as_array().unwrap().len(), 32);
        assert_eq!(doc[KEYPAIR_STORAGE_KEY]["privateKey"].as_array().unwrap().len(), 32);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        FileKeyStore::new(&path)
            .persist(&KeyPair::generate())
            .await
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn concurrent_persists_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys.json"));
        let first = KeyPair::generate();
        let second = KeyPair::generate();

        let (a, b) = tokio::join!(store.persist(&first), store.persist(&second));
        a.unwrap();
        b.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert!(
            loaded.public_key_bytes() == first.public_key_bytes()
                || loaded.public_key_bytes() == second.public_key_bytes()
        );
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["keys.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileKeyStore::new(&path);
        assert!(matches!(store.load().await, Err(CryptoError::KeyStorage(_))));
        // Must not be overwritten by a freshly generated key either.
        assert!(matches!(
            load_or_generate(&store).await,
            Err(CryptoError::KeyStorage(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn load_or_generate_is_stable() {
        let store = MemoryKeyStore::new();
        let first = load_or_generate(&store).await.unwrap();
        let second = load_or_generate(&store).await.unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[tokio::test]
    async fn memory_store_with_pair() {
        let pair = KeyPair::generate();
        let store = MemoryKeyStore::with_pair(&pair);
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.public_key_bytes(), pair.public_key_bytes());
    }
}
