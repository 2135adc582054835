//! Sharded-file backend
//!
//! Directory layout:
//! - `root.commit`: one byte, `0` or `1`, naming the authoritative root buffer
//! - `root0.json` / `root1.json`: alternating root buffers
//!   `{ "sequence": n, "data": {key: handle}, "types": {key: type}, "creationDates": {key: millis} }`
//! - `<handle>.json`: one value file per live handle
//!
//! A root is committed by writing it to the buffer the marker does not name
//! and then flipping the marker. Both writes go through temp-file + rename, so
//! a reader resolving the root through the marker only ever sees a fully
//! written buffer.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use cairnstore::{
    read_content_with_retry, read_with_retry, remove_if_exists, write_atomic, RetryPolicy,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Backend, Supplier, Updater};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::value::{Cacheable, TypeRegistry, Value};

const MARKER_FILE: &str = "root.commit";
const FILE_EXT: &str = "json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShardRoot {
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    data: BTreeMap<String, u64>,
    #[serde(default)]
    types: BTreeMap<String, String>,
    #[serde(default)]
    creation_dates: BTreeMap<String, i64>,
}

impl ShardRoot {
    fn issue_handle(&mut self) -> u64 {
        let handle = self.sequence;
        self.sequence += 1;
        handle
    }

    fn forget(&mut self, key: &str) -> Option<u64> {
        self.types.remove(key);
        self.creation_dates.remove(key);
        self.data.remove(key)
    }
}

/// The double-buffered root and its commit marker
struct RootFiles {
    dir: PathBuf,
}

impl RootFiles {
    fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    fn buffer_path(&self, index: u8) -> PathBuf {
        self.dir.join(format!("root{}.{}", index, FILE_EXT))
    }

    /// Index of the committed buffer, `None` if nothing was committed yet
    fn committed(&self) -> Option<u8> {
        match read_with_retry(&self.marker_path(), &RetryPolicy::none()) {
            Ok(Some(bytes)) => match bytes.first() {
                Some(0) | Some(b'0') => Some(0),
                Some(1) | Some(b'1') => Some(1),
                other => {
                    warn!(dir = %self.dir.display(), marker = ?other, "invalid commit marker, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "unreadable commit marker, ignoring");
                None
            }
        }
    }

    fn load(&self, retry: &RetryPolicy) -> ShardRoot {
        let Some(index) = self.committed() else {
            return ShardRoot::default();
        };
        let path = self.buffer_path(index);

        match read_with_retry(&path, retry) {
            Ok(Some(bytes)) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "garbled root buffer, starting empty");
                    ShardRoot::default()
                })
            }
            Ok(_) => {
                warn!(path = %path.display(), "committed root buffer missing or blank, starting empty");
                ShardRoot::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable root buffer, starting empty");
                ShardRoot::default()
            }
        }
    }

    /// Write `root` into the buffer the marker does not name
    fn stage(&self, root: &ShardRoot) -> Result<u8> {
        let next = self.committed().map(|c| (c + 1) % 2).unwrap_or(0);
        write_atomic(&self.buffer_path(next), &serde_json::to_vec(root)?)?;
        Ok(next)
    }

    /// Point the marker at `index`
    fn flip(&self, index: u8) -> Result<()> {
        Ok(write_atomic(&self.marker_path(), &[index])?)
    }

    fn persist(&self, root: &ShardRoot) -> Result<()> {
        let index = self.stage(root)?;
        self.flip(index)?;
        debug!(dir = %self.dir.display(), buffer = index, entries = root.data.len(), "committed shard root");
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        remove_if_exists(&self.marker_path())?;
        remove_if_exists(&self.buffer_path(0))?;
        remove_if_exists(&self.buffer_path(1))?;
        Ok(())
    }
}

/// One file per value, indexed by a crash-tolerant root document
pub struct ShardedBackend {
    dir: PathBuf,
    files: RootFiles,
    native: bool,
    registry: Arc<TypeRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    root: RwLock<Option<Arc<ShardRoot>>>,
    write_lock: Mutex<()>,
}

impl ShardedBackend {
    /// Open (creating if needed) a sharded cache directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            files: RootFiles { dir: dir.clone() },
            dir,
            native: false,
            registry: Arc::new(TypeRegistry::default()),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            root: RwLock::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// Store `string` and `bytes` values as raw file content instead of JSON.
    ///
    /// The setting must stay the same for the lifetime of a directory.
    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Resolve stored type names with `registry`
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use a different time source for creation stamps and ages
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry budget for root and value reads
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drop the loaded root and resolve it again through the commit marker
    pub fn reload(&self) {
        let _guard = self.write_lock.lock();
        let root = Arc::new(self.files.load(&self.retry));
        *self.root.write() = Some(root);
    }

    fn value_path(&self, handle: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", handle, FILE_EXT))
    }

    fn snapshot(&self) -> Arc<ShardRoot> {
        if let Some(root) = self.root.read().as_ref() {
            return Arc::clone(root);
        }
        let _guard = self.write_lock.lock();
        self.snapshot_locked()
    }

    // Caller holds `write_lock`.
    fn snapshot_locked(&self) -> Arc<ShardRoot> {
        if let Some(root) = self.root.read().as_ref() {
            return Arc::clone(root);
        }
        let root = Arc::new(self.files.load(&self.retry));
        *self.root.write() = Some(Arc::clone(&root));
        root
    }

    // Caller holds `write_lock`.
    fn commit(&self, next: ShardRoot) -> Result<()> {
        self.files.persist(&next)?;
        *self.root.write() = Some(Arc::new(next));
        Ok(())
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        if self.native {
            if let Some(text) = value.downcast_ref::<String>() {
                return Ok(text.as_bytes().to_vec());
            }
            if let Some(bytes) = value.downcast_ref::<Vec<u8>>() {
                return Ok(bytes.clone());
            }
        }
        Ok(serde_json::to_vec(&value.to_json()?)?)
    }

    fn decode(&self, type_name: &str, bytes: Vec<u8>) -> Result<Value> {
        if self.native {
            if type_name == String::TYPE_NAME {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::Malformed(format!("native string value: {}", e)))?;
                return Ok(Value::new(text));
            }
            if type_name == <Vec<u8>>::TYPE_NAME {
                return Ok(Value::new(bytes));
            }
        }
        self.registry.decode_slice(type_name, &bytes)
    }

    fn read_value(&self, root: &ShardRoot, key: &str) -> Result<Option<Value>> {
        let Some(handle) = root.data.get(key) else {
            return Ok(None);
        };
        let type_name = root
            .types
            .get(key)
            .ok_or_else(|| Error::UnresolvedType(format!("<missing type for {}>", key)))?;

        // native values may be empty, so blank files are not retried
        let path = self.value_path(*handle);
        match read_content_with_retry(&path, &self.retry) {
            Ok(Some(bytes)) => self.decode(type_name, bytes).map(Some),
            Ok(None) => {
                warn!(key, path = %path.display(), "value file missing, treating as absent");
                Ok(None)
            }
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "value file unreadable, treating as absent");
                Ok(None)
            }
        }
    }

    fn discard(&self, handles: impl IntoIterator<Item = u64>) {
        for handle in handles {
            let path = self.value_path(handle);
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete orphaned value file");
            }
        }
    }

    // Caller holds `write_lock`. Value files are written before the root that
    // references them; replaced files are deleted only after the commit.
    fn store_locked(&self, current: &ShardRoot, entries: &[(String, Value)]) -> Result<()> {
        let encoded = entries
            .iter()
            .map(|(_, value)| self.encode(value))
            .collect::<Result<Vec<_>>>()?;

        let mut next = current.clone();
        let now = self.clock.now_millis();
        let mut written = Vec::with_capacity(entries.len());
        let mut orphans = Vec::new();

        for ((key, value), bytes) in entries.iter().zip(&encoded) {
            let handle = next.issue_handle();
            if let Err(e) = write_atomic(&self.value_path(handle), bytes) {
                self.discard(written);
                return Err(e.into());
            }
            written.push(handle);

            if let Some(old) = next.data.insert(key.clone(), handle) {
                orphans.push(old);
            }
            next.types.insert(key.clone(), value.type_name().to_string());
            next.creation_dates.insert(key.clone(), now);
        }

        if let Err(e) = self.commit(next) {
            self.discard(written);
            return Err(e);
        }
        self.discard(orphans);
        Ok(())
    }

    fn is_value_file(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(FILE_EXT)
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false)
    }
}

impl Backend for ShardedBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.read_value(&self.snapshot(), key)
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        Ok(self.snapshot().types.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        self.store_locked(&current, &[(key.to_string(), value)])
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        self.store_locked(&current, &entries)
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        if let Some(value) = self.read_value(&current, key)? {
            return Ok(value);
        }

        let value = supplier()?;
        self.store_locked(&current, &[(key.to_string(), value.clone())])?;
        Ok(value)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        let value = match self.read_value(&current, key)? {
            Some(existing) => update(existing)?,
            None => supplier()?,
        };
        self.store_locked(&current, &[(key.to_string(), value.clone())])?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.remove_all(&[key.to_string()])
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        let mut next = (*current).clone();
        let orphans: Vec<u64> = keys.iter().filter_map(|k| next.forget(k)).collect();
        if orphans.is_empty() {
            return Ok(());
        }

        self.commit(next)?;
        self.discard(orphans);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.snapshot().data.contains_key(key))
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        Ok(self.snapshot().data.keys().cloned().collect())
    }

    fn size(&self) -> Result<usize> {
        Ok(self.snapshot().data.len())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.files.remove_all()?;
        *self.root.write() = Some(Arc::new(ShardRoot::default()));

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if Self::is_value_file(&path) {
                remove_if_exists(&path)?;
            }
        }
        debug!(dir = %self.dir.display(), "cleared sharded cache");
        Ok(())
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        let root = self.snapshot();
        if let Some(created) = root.creation_dates.get(key) {
            return Ok(Some(self.clock.age_of(*created)));
        }

        // roots written without creation dates fall back to the file time
        let Some(handle) = root.data.get(key) else {
            return Ok(None);
        };
        let modified = fs::metadata(self.value_path(*handle)).and_then(|m| m.modified());
        Ok(modified
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since_epoch| self.clock.age_of(since_epoch.as_millis() as i64)))
    }
}
