//! State records and the backends storing them.
//!
//! A record holds the resources and outputs of one instance. Writes are
//! compare-and-swap on the record serial and require the caller to hold the
//! key's lock; a held lock makes other lockers fail immediately.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use terrace_spec::models::{Attributes, CommandKind, InstanceId, Secret, TagSet};

use crate::error::{IacError, IacResult};
use crate::locator::{StateKey, STATE_FILE};
use crate::renderer::redact;

/// Current on-disk record format.
pub const STATE_VERSION: u32 = 1;

/// Last known state of one provisioned resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub address: String,
    pub resource_type: String,
    /// Desired attributes as last applied.
    pub inputs: Attributes,
    /// Attributes reported by the provisioner, including computed ones.
    pub attributes: Attributes,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive_attributes: BTreeSet<String>,
}

/// Persisted state of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,
    pub serial: u64,
    pub instance: InstanceId,
    pub module: String,
    pub module_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// False when the last apply stopped part-way.
    pub complete: bool,
    pub resources: Vec<ResourceState>,
    pub outputs: Attributes,
    #[serde(default)]
    pub sensitive_outputs: BTreeSet<String>,
    /// Instances this one depended on when it was last applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl StateRecord {
    pub fn new(
        instance: InstanceId,
        module: impl Into<String>,
        module_version: impl Into<String>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            instance,
            module: module.into(),
            module_version: module_version.into(),
            run_id: None,
            updated_at: Utc::now(),
            complete: false,
            resources: Vec::new(),
            outputs: Attributes::new(),
            sensitive_outputs: BTreeSet::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn resource(&self, address: &str) -> Option<&ResourceState> {
        self.resources.iter().find(|r| r.address == address)
    }

    /// Applied attributes keyed by resource address.
    pub fn applied_attributes(&self) -> BTreeMap<String, Attributes> {
        self.resources
            .iter()
            .map(|r| (r.address.clone(), r.attributes.clone()))
            .collect()
    }

    /// Outputs with sensitive values masked.
    pub fn redacted_outputs(&self) -> Attributes {
        redact(&self.outputs, &self.sensitive_outputs)
    }
}

/// Holder of a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub run_id: String,
    pub operation: CommandKind,
    pub who: String,
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(run_id: impl Into<String>, operation: CommandKind) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            operation,
            who: format!("{}@pid{}", user, std::process::id()),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock {} of run {} ({} by {} since {})",
            self.id,
            self.run_id,
            self.operation,
            self.who,
            self.created_at.to_rfc3339()
        )
    }
}

/// Storage for state records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn read(&self, key: &StateKey) -> IacResult<Option<StateRecord>>;

    /// Store `record` if `lock` holds the key and `record.serial` is exactly
    /// one above the stored serial (zero when absent).
    async fn write(&self, key: &StateKey, record: &StateRecord, lock: &LockInfo) -> IacResult<()>;

    async fn delete(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()>;

    /// Take the key's lock; fails with `LockContention` when already held.
    async fn lock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()>;

    async fn unlock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()>;

    /// Current holder of the key's lock, if any.
    async fn lock_holder(&self, key: &StateKey) -> IacResult<Option<LockInfo>>;

    /// Release a lock left behind by a run that died, without holding it.
    /// `lock_id` must match the current holder; the released lock is
    /// returned.
    async fn force_unlock(&self, key: &StateKey, lock_id: &str) -> IacResult<LockInfo>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> IacResult<Vec<StateKey>>;
}

fn check_holder(key: &StateKey, held: Option<LockInfo>, lock_id: &str) -> IacResult<LockInfo> {
    match held {
        Some(held) if held.id == lock_id => Ok(held),
        Some(held) => Err(IacError::LockIdMismatch {
            key: key.to_string(),
            requested: lock_id.to_string(),
            holder: held.to_string(),
        }),
        None => Err(IacError::LockNotHeld {
            key: key.to_string(),
        }),
    }
}

fn check_serial(key: &StateKey, stored: Option<u64>, record: &StateRecord) -> IacResult<()> {
    let expected = stored.unwrap_or(0) + 1;
    if record.serial == expected {
        Ok(())
    } else {
        Err(IacError::SerialMismatch {
            key: key.to_string(),
            expected,
            found: record.serial,
        })
    }
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<StateKey, StateRecord>,
    locks: HashMap<StateKey, LockInfo>,
}

impl MemoryInner {
    fn check_lock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        match self.locks.get(key) {
            Some(held) if held.id == lock.id => Ok(()),
            _ => Err(IacError::LockNotHeld {
                key: key.to_string(),
            }),
        }
    }
}

/// In-process state store. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_locked(&self, key: &StateKey) -> bool {
        self.inner.lock().locks.contains_key(key)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &StateKey) -> IacResult<Option<StateRecord>> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    async fn write(&self, key: &StateKey, record: &StateRecord, lock: &LockInfo) -> IacResult<()> {
        let mut inner = self.inner.lock();
        inner.check_lock(key, lock)?;
        check_serial(key, inner.records.get(key).map(|r| r.serial), record)?;
        inner.records.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        let mut inner = self.inner.lock();
        inner.check_lock(key, lock)?;
        inner.records.remove(key);
        Ok(())
    }

    async fn lock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        let mut inner = self.inner.lock();
        if let Some(held) = inner.locks.get(key) {
            if held.id != lock.id {
                return Err(IacError::LockContention {
                    key: key.to_string(),
                    holder: held.to_string(),
                });
            }
        }
        inner.locks.insert(key.clone(), lock.clone());
        Ok(())
    }

    async fn unlock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        let mut inner = self.inner.lock();
        inner.check_lock(key, lock)?;
        inner.locks.remove(key);
        Ok(())
    }

    async fn lock_holder(&self, key: &StateKey) -> IacResult<Option<LockInfo>> {
        Ok(self.inner.lock().locks.get(key).cloned())
    }

    async fn force_unlock(&self, key: &StateKey, lock_id: &str) -> IacResult<LockInfo> {
        let mut inner = self.inner.lock();
        let held = check_holder(key, inner.locks.get(key).cloned(), lock_id)?;
        inner.locks.remove(key);
        warn!("Force-released {} on {}", held, key);
        Ok(held)
    }

    async fn list(&self, prefix: &str) -> IacResult<Vec<StateKey>> {
        Ok(self
            .inner
            .lock()
            .records
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// State store on the local filesystem.
///
/// Records live at `<root>/<key>` as pretty JSON next to a `.lock` file
/// created exclusively while a run holds the key.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &StateKey) -> PathBuf {
        key.components()
            .fold(self.root.clone(), |path, component| path.join(component))
    }

    fn sibling(&self, key: &StateKey, suffix: &str) -> PathBuf {
        let mut path = self.path(key).into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    async fn read_lock(&self, key: &StateKey) -> IacResult<Option<LockInfo>> {
        match tokio::fs::read_to_string(self.sibling(key, ".lock")).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_lock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        match self.read_lock(key).await? {
            Some(held) if held.id == lock.id => Ok(()),
            _ => Err(IacError::LockNotHeld {
                key: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, key: &StateKey) -> IacResult<Option<StateRecord>> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &StateKey, record: &StateRecord, lock: &LockInfo) -> IacResult<()> {
        self.check_lock(key, lock).await?;
        let stored = self.read(key).await?.map(|r| r.serial);
        check_serial(key, stored, record)?;

        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.sibling(key, ".tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote state {} (serial {})", key, record.serial);
        Ok(())
    }

    async fn delete(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        self.check_lock(key, lock).await?;
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        let path = self.sibling(key, ".lock");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(lock)?).await?;
                file.flush().await?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = match self.read_lock(key).await {
                    Ok(Some(held)) if held.id == lock.id => return Ok(()),
                    Ok(Some(held)) => held.to_string(),
                    _ => "an unknown holder".to_string(),
                };
                Err(IacError::LockContention {
                    key: key.to_string(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, key: &StateKey, lock: &LockInfo) -> IacResult<()> {
        self.check_lock(key, lock).await?;
        tokio::fs::remove_file(self.sibling(key, ".lock")).await?;
        Ok(())
    }

    async fn lock_holder(&self, key: &StateKey) -> IacResult<Option<LockInfo>> {
        self.read_lock(key).await
    }

    async fn force_unlock(&self, key: &StateKey, lock_id: &str) -> IacResult<LockInfo> {
        let held = check_holder(key, self.read_lock(key).await?, lock_id)?;
        tokio::fs::remove_file(self.sibling(key, ".lock")).await?;
        warn!("Force-released {} on {}", held, key);
        Ok(held)
    }

    async fn list(&self, prefix: &str) -> IacResult<Vec<StateKey>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || path.file_name().map_or(true, |n| n != STATE_FILE) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let raw = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if raw.starts_with(prefix) {
                keys.push(StateKey::from_raw(raw));
            }
        }
        keys.sort();
        info!("Found {} state record(s) under {}", keys.len(), prefix);
        Ok(keys)
    }
}

impl fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryStateStore({} records)", self.len())
    }
}

/// Mask sensitive outputs of `record` for display.
pub fn display_outputs(record: &StateRecord) -> BTreeMap<String, String> {
    record
        .outputs
        .iter()
        .map(|(k, v)| {
            let shown = if record.sensitive_outputs.contains(k) {
                Secret::REDACTED.to_string()
            } else {
                v.to_string()
            };
            (k.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::StateLocator;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(serial: u64) -> StateRecord {
        let mut record = StateRecord::new(InstanceId::new("qa", "us-east-1", "db"), "aurora", "1.0.0");
        record.serial = serial;
        record.updated_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        record.outputs.insert("endpoint".to_string(), json!("db.local"));
        record.outputs.insert("password".to_string(), json!("hunter2"));
        record.sensitive_outputs.insert("password".to_string());
        record
    }

    async fn exercise(store: &dyn StateStore) {
        let locator = StateLocator::new("acme");
        let key = locator.key(&InstanceId::new("qa", "us-east-1", "db"));
        let other = locator.key(&InstanceId::new("prod", "us-east-1", "db"));

        let first = LockInfo::new("run-1", CommandKind::Apply);
        let second = LockInfo::new("run-2", CommandKind::Apply);

        assert!(store.read(&key).await.unwrap().is_none());
        assert!(matches!(
            store.write(&key, &record(1), &first).await,
            Err(IacError::LockNotHeld { .. })
        ));

        store.lock(&key, &first).await.unwrap();
        let err = store.lock(&key, &second).await.unwrap_err();
        assert!(matches!(err, IacError::LockContention { ref holder, .. } if holder.contains("run-1")));
        // Locks are per key.
        store.lock(&other, &second).await.unwrap();

        store.write(&key, &record(1), &first).await.unwrap();
        assert!(matches!(
            store.write(&key, &record(1), &first).await,
            Err(IacError::SerialMismatch { expected: 2, found: 1, .. })
        ));
        store.write(&key, &record(2), &first).await.unwrap();

        let stored = store.read(&key).await.unwrap().unwrap();
        assert_eq!(stored, record(2));
        assert_eq!(stored.redacted_outputs()["password"], json!("<sensitive>"));

        assert_eq!(
            store.list(&locator.environment_prefix("qa", "us-east-1")).await.unwrap(),
            vec![key.clone()]
        );

        assert!(store.unlock(&key, &second).await.is_err());
        store.unlock(&key, &first).await.unwrap();
        store.lock(&key, &second).await.unwrap();
        store.delete(&key, &second).await.unwrap();
        assert!(store.read(&key).await.unwrap().is_none());
        store.unlock(&key, &second).await.unwrap();
        store.unlock(&other, &second).await.unwrap();
    }

    async fn release_abandoned_lock(store: &dyn StateStore) {
        let key = StateLocator::new("acme").key(&InstanceId::new("qa", "us-east-1", "db"));
        let crashed = LockInfo::new("run-1", CommandKind::Apply);
        store.lock(&key, &crashed).await.unwrap();

        assert_eq!(store.lock_holder(&key).await.unwrap(), Some(crashed.clone()));
        assert!(matches!(
            store.force_unlock(&key, "not-the-holder").await,
            Err(IacError::LockIdMismatch { .. })
        ));
        assert!(store.lock_holder(&key).await.unwrap().is_some());

        let released = store.force_unlock(&key, &crashed.id).await.unwrap();
        assert_eq!(released, crashed);
        assert!(store.lock_holder(&key).await.unwrap().is_none());
        assert!(matches!(
            store.force_unlock(&key, &crashed.id).await,
            Err(IacError::LockNotHeld { .. })
        ));

        let next = LockInfo::new("run-2", CommandKind::Apply);
        store.lock(&key, &next).await.unwrap();
        store.write(&key, &record(1), &next).await.unwrap();
        assert!(store.write(&key, &record(2), &crashed).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise(&MemoryStateStore::new()).await;
        release_abandoned_lock(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempdir().unwrap();
        exercise(&FileStateStore::new(dir.path())).await;
        let dir = tempdir().unwrap();
        release_abandoned_lock(&FileStateStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let key = StateLocator::new("acme").key(&InstanceId::new("qa", "us-east-1", "db"));
        let lock = LockInfo::new("run-1", CommandKind::Apply);
        {
            let store = FileStateStore::new(dir.path());
            store.lock(&key, &lock).await.unwrap();
            store.write(&key, &record(1), &lock).await.unwrap();
        }
        let reopened = FileStateStore::new(dir.path());
        assert_eq!(reopened.read(&key).await.unwrap().unwrap().serial, 1);
        assert!(reopened
            .lock(&key, &LockInfo::new("run-2", CommandKind::Destroy))
            .await
            .is_err());
    }

    #[test]
    fn test_display_outputs_masks_sensitive() {
        let shown = display_outputs(&record(1));
        assert_eq!(shown["endpoint"], "\"db.local\"");
        assert_eq!(shown["password"], "<sensitive>");
    }
}
