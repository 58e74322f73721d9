use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::header::{HeaderName, AUTHORIZATION};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ClientAuthConfig;
use crate::error::BridgeError;
use crate::util::{random_hex, unix_now_secs};

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
pub const ISSUED_KEY_PREFIX: &str = "clb_";
const SECONDS_PER_DAY: u64 = 86_400;

/// Extract the client key from `Authorization: Bearer <key>` or `X-API-Key: <key>`.
///
/// # Errors
///
/// Returns `BridgeError::Auth` when neither header carries a key.
pub fn extract_api_key(headers: &http::HeaderMap) -> Result<&str, BridgeError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| headers.get(X_API_KEY).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| BridgeError::Auth("API key required".to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("failed to access key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode or decode key file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Metadata of one issued key. The raw key is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub key_hash: String,
    pub name: String,
    /// Unix seconds.
    pub created_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,
    /// Requests per minute.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_permissions() -> Vec<String> {
    vec!["read".to_string(), "write".to_string()]
}

fn default_enabled() -> bool {
    true
}

impl ApiKeyRecord {
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }

    #[must_use]
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.enabled && !self.is_expired_at(now)
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Options for [`ApiKeyStore::create_key`].
#[derive(Debug, Clone, Default)]
pub struct NewKey {
    pub name: String,
    pub permissions: Option<Vec<String>>,
    pub expires_days: Option<u64>,
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Default)]
struct KeyIndex {
    by_id: FxHashMap<String, ApiKeyRecord>,
    hash_to_id: FxHashMap<String, String>,
}

impl KeyIndex {
    fn insert(&mut self, record: ApiKeyRecord) {
        self.hash_to_id
            .insert(record.key_hash.clone(), record.key_id.clone());
        self.by_id.insert(record.key_id.clone(), record);
    }

    fn remove(&mut self, key_id: &str) -> Option<ApiKeyRecord> {
        let record = self.by_id.remove(key_id)?;
        self.hash_to_id.remove(&record.key_hash);
        Some(record)
    }

    fn sorted(&self) -> Vec<ApiKeyRecord> {
        let mut records: Vec<_> = self.by_id.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key_id.cmp(&b.key_id))
        });
        records
    }
}

fn hash_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Issued API keys persisted as JSON.
#[derive(Debug)]
pub struct ApiKeyStore {
    path: Option<PathBuf>,
    index: RwLock<KeyIndex>,
}

impl ApiKeyStore {
    /// A store that never touches the filesystem.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            index: RwLock::new(KeyIndex::default()),
        }
    }

    /// Open the store at `path`, loading existing keys when the file exists.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` when the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let store = Self {
            path: Some(path.into()),
            index: RwLock::new(KeyIndex::default()),
        };
        store.load()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().by_id.is_empty()
    }

    /// Replace the in-memory index with the file contents. Unparseable
    /// entries are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` on I/O failure or when the file is not a JSON array.
    pub fn load(&self) -> Result<usize, KeyStoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(KeyStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&contents).map_err(|source| KeyStoreError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let mut index = KeyIndex::default();
        for entry in entries {
            match serde_json::from_value::<ApiKeyRecord>(entry) {
                Ok(record) => index.insert(record),
                Err(err) => tracing::error!(error = %err, "failed to parse API key entry"),
            }
        }
        let count = index.by_id.len();
        *self.index.write() = index;
        tracing::info!(path = %path.display(), count, "loaded API keys");
        Ok(count)
    }

    /// Write every record to the backing file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` when serialization or the write fails.
    pub fn save(&self) -> Result<(), KeyStoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let records = self.index.read().sorted();
        let json = serde_json::to_string_pretty(&records).map_err(|source| KeyStoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| KeyStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, json).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), count = records.len(), "saved API keys");
        Ok(())
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            tracing::error!(error = %err, "failed to save API keys");
        }
    }

    /// Issue a new key and return the raw `clb_` string. Only its hash is kept.
    pub fn create_key(&self, options: NewKey) -> String {
        let now = unix_now_secs();
        let raw_key = format!("{ISSUED_KEY_PREFIX}{}{}", random_hex(32), random_hex(32));
        let record = ApiKeyRecord {
            key_id: random_hex(22),
            key_hash: hash_key(&raw_key),
            name: options.name,
            created_at: now,
            expires_at: options
                .expires_days
                .map(|days| now + days.saturating_mul(SECONDS_PER_DAY)),
            last_used: None,
            permissions: options.permissions.unwrap_or_else(default_permissions),
            rate_limit: options.rate_limit,
            enabled: true,
        };
        tracing::info!(key_id = %record.key_id, name = %record.name, "created API key");
        self.index.write().insert(record);
        self.persist();
        raw_key
    }

    /// Look up a raw key. Valid keys get `last_used` stamped.
    #[must_use]
    pub fn validate_key(&self, raw_key: &str) -> Option<ApiKeyRecord> {
        if !raw_key.starts_with(ISSUED_KEY_PREFIX) {
            return None;
        }
        let key_hash = hash_key(raw_key);
        let now = unix_now_secs();
        let mut index = self.index.write();
        let key_id = index.hash_to_id.get(&key_hash)?.clone();
        let record = index.by_id.get_mut(&key_id)?;
        if !record.is_valid_at(now) {
            return None;
        }
        record.last_used = Some(now);
        Some(record.clone())
    }

    /// Disable a key without deleting it.
    pub fn revoke_key(&self, key_id: &str) -> bool {
        let revoked = match self.index.write().by_id.get_mut(key_id) {
            Some(record) => {
                record.enabled = false;
                true
            }
            None => false,
        };
        if revoked {
            tracing::info!(key_id, "revoked API key");
            self.persist();
        }
        revoked
    }

    pub fn delete_key(&self, key_id: &str) -> bool {
        let deleted = self.index.write().remove(key_id).is_some();
        if deleted {
            tracing::info!(key_id, "deleted API key");
            self.persist();
        }
        deleted
    }

    /// All records ordered by creation time.
    #[must_use]
    pub fn list_keys(&self) -> Vec<ApiKeyRecord> {
        self.index.read().sorted()
    }

    #[must_use]
    pub fn get_key(&self, key_id: &str) -> Option<ApiKeyRecord> {
        self.index.read().by_id.get(key_id).cloned()
    }

    /// Delete every expired key and return how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = unix_now_secs();
        let removed = {
            let mut index = self.index.write();
            let expired: Vec<String> = index
                .by_id
                .values()
                .filter(|record| record.is_expired_at(now))
                .map(|record| record.key_id.clone())
                .collect();
            for key_id in &expired {
                index.remove(key_id);
            }
            expired.len()
        };
        if removed > 0 {
            tracing::info!(removed, "removed expired API keys");
            self.persist();
        }
        removed
    }

    /// Issue an admin key when the store is empty. Returns the raw key if one was created.
    pub fn ensure_default_key(&self) -> Option<String> {
        if !self.is_empty() {
            return None;
        }
        let raw_key = self.create_key(NewKey {
            name: "default".to_string(),
            permissions: Some(vec![
                "read".to_string(),
                "write".to_string(),
                "admin".to_string(),
            ]),
            ..NewKey::default()
        });
        tracing::warn!(
            key = %raw_key,
            "default API key created; create proper keys and delete this one in production"
        );
        Some(raw_key)
    }
}

/// Client authentication: static keys from config plus the issued-key store.
#[derive(Debug)]
pub struct ClientAuth {
    static_keys: FxHashSet<String>,
    store: Option<Arc<ApiKeyStore>>,
}

impl ClientAuth {
    #[must_use]
    pub fn new(static_keys: impl IntoIterator<Item = String>, store: Option<Arc<ApiKeyStore>>) -> Self {
        Self {
            static_keys: static_keys.into_iter().collect(),
            store,
        }
    }

    /// Build from config, opening the key file and issuing a default key when asked.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` when the configured key file cannot be loaded.
    pub fn from_config(config: &ClientAuthConfig) -> Result<Self, KeyStoreError> {
        let store = match config.keys_file.as_deref() {
            Some(path) => {
                let store = ApiKeyStore::open(path)?;
                if config.create_default_key {
                    store.ensure_default_key();
                }
                Some(Arc::new(store))
            }
            None => None,
        };
        Ok(Self::new(config.allowed_keys.iter().cloned(), store))
    }

    #[must_use]
    pub fn store(&self) -> Option<&Arc<ApiKeyStore>> {
        self.store.as_ref()
    }

    /// # Errors
    ///
    /// Returns `BridgeError::Auth` when the key is missing, unknown, revoked or expired.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), BridgeError> {
        let key = extract_api_key(headers)?;
        if self.static_keys.contains(key) {
            return Ok(());
        }
        if let Some(record) = self.store.as_ref().and_then(|store| store.validate_key(key)) {
            tracing::debug!(key_id = %record.key_id, "authenticated with issued key");
            return Ok(());
        }
        Err(BridgeError::Auth("Invalid or expired API key".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(name: &'static str, value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            HeaderName::from_static(name),
            http::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_extract_bearer_and_x_api_key() {
        assert_eq!(
            extract_api_key(&headers("authorization", "Bearer sk-1")).unwrap(),
            "sk-1"
        );
        assert_eq!(extract_api_key(&headers("x-api-key", "sk-2")).unwrap(), "sk-2");
        let err = extract_api_key(&http::HeaderMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "API key required");
    }

    #[test]
    fn test_static_key_authentication() {
        let auth = ClientAuth::new(vec!["sk-ok".to_string()], None);
        assert!(auth.authenticate(&headers("authorization", "Bearer sk-ok")).is_ok());
        let err = auth
            .authenticate(&headers("authorization", "Bearer sk-bad"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Auth(_)));
    }

    #[test]
    fn test_issued_key_lifecycle() {
        let store = Arc::new(ApiKeyStore::in_memory());
        let raw = store.create_key(NewKey {
            name: "ci".into(),
            ..NewKey::default()
        });
        assert!(raw.starts_with("clb_"));

        let auth = ClientAuth::new(Vec::new(), Some(Arc::clone(&store)));
        assert!(auth.authenticate(&headers("x-api-key", &raw)).is_ok());

        let record = store.list_keys().pop().unwrap();
        assert_ne!(record.key_hash, raw);
        assert!(store.get_key(&record.key_id).unwrap().last_used.is_some());
        assert!(record.has_permission("write"));

        assert!(store.revoke_key(&record.key_id));
        assert!(auth.authenticate(&headers("x-api-key", &raw)).is_err());
        assert!(store.delete_key(&record.key_id));
        assert!(!store.delete_key(&record.key_id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_validate_requires_prefix() {
        let store = ApiKeyStore::in_memory();
        assert!(store.validate_key("sk-not-issued").is_none());
    }

    #[test]
    fn test_persistence_and_cleanup_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keys.json");

        let store = ApiKeyStore::open(&path).unwrap();
        let raw = store.create_key(NewKey {
            name: "kept".into(),
            expires_days: Some(30),
            ..NewKey::default()
        });
        assert!(path.exists());

        // Append an already-expired record directly to the file.
        let mut records: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        records.push(serde_json::json!({
            "key_id": "old",
            "key_hash": "00",
            "name": "expired",
            "created_at": 1,
            "expires_at": 2
        }));
        records.push(serde_json::json!({"garbage": true}));
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let reopened = ApiKeyStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.validate_key(&raw).is_some());
        assert_eq!(reopened.cleanup_expired(), 1);
        assert!(reopened.get_key("old").is_none());
        assert_eq!(ApiKeyStore::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_default_key_only_when_empty() {
        let store = ApiKeyStore::in_memory();
        let raw = store.ensure_default_key().unwrap();
        let record = store.validate_key(&raw).unwrap();
        assert!(record.has_permission("admin"));
        assert!(store.ensure_default_key().is_none());
    }
}
