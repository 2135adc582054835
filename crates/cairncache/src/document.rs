//! Single-document backend
//!
//! File format:
//! ```text
//! { "data": {key: json}, "types": {key: type}, "creationDates": {key: epoch-millis} }
//! ```
//!
//! The whole document is re-encoded and rewritten on every mutation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cairnstore::{read_with_retry, write_atomic, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Backend, Supplier, Updater};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::value::{TypeRegistry, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRoot {
    #[serde(default)]
    data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    types: BTreeMap<String, String>,
    #[serde(default)]
    creation_dates: BTreeMap<String, i64>,
}

impl DocumentRoot {
    fn insert(&mut self, key: String, value: &Value, now: i64) -> Result<()> {
        self.data.insert(key.clone(), value.to_json()?);
        self.types.insert(key.clone(), value.type_name().to_string());
        self.creation_dates.insert(key, now);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> bool {
        self.types.remove(key);
        self.creation_dates.remove(key);
        self.data.remove(key).is_some()
    }
}

/// All entries in one JSON document, loaded lazily and rewritten whole
pub struct DocumentBackend {
    path: PathBuf,
    registry: Arc<TypeRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    root: RwLock<Option<Arc<DocumentRoot>>>,
    write_lock: Mutex<()>,
}

impl DocumentBackend {
    /// Back the cache with the document at `path`. Nothing is read until first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            registry: Arc::new(TypeRegistry::default()),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            root: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
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

    /// Retry budget for the initial load
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Location of the document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the loaded document and read it again from disk
    pub fn reload(&self) {
        let _guard = self.write_lock.lock();
        let root = Arc::new(self.load());
        *self.root.write() = Some(root);
    }

    fn load(&self) -> DocumentRoot {
        let bytes = match read_with_retry(&self.path, &self.retry) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return DocumentRoot::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable cache document, starting empty");
                return DocumentRoot::default();
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            warn!(path = %self.path.display(), "blank cache document, starting empty");
            return DocumentRoot::default();
        }

        match serde_json::from_slice(&bytes) {
            Ok(root) => root,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "garbled cache document, starting empty");
                DocumentRoot::default()
            }
        }
    }

    fn snapshot(&self) -> Arc<DocumentRoot> {
        if let Some(root) = self.root.read().as_ref() {
            return Arc::clone(root);
        }
        let _guard = self.write_lock.lock();
        self.snapshot_locked()
    }

    // Caller holds `write_lock`.
    fn snapshot_locked(&self) -> Arc<DocumentRoot> {
        if let Some(root) = self.root.read().as_ref() {
            return Arc::clone(root);
        }
        let root = Arc::new(self.load());
        *self.root.write() = Some(Arc::clone(&root));
        root
    }

    // Caller holds `write_lock`.
    fn commit(&self, next: DocumentRoot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec(&next)?;
        write_atomic(&self.path, &encoded)?;
        debug!(path = %self.path.display(), entries = next.data.len(), bytes = encoded.len(), "committed cache document");
        *self.root.write() = Some(Arc::new(next));
        Ok(())
    }

    fn decode(&self, root: &DocumentRoot, key: &str) -> Result<Option<Value>> {
        let Some(json) = root.data.get(key) else {
            return Ok(None);
        };
        let type_name = root
            .types
            .get(key)
            .ok_or_else(|| Error::UnresolvedType(format!("<missing type for {}>", key)))?;
        self.registry.decode(type_name, json.clone()).map(Some)
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut DocumentRoot, i64) -> Result<bool>,
    {
        let _guard = self.write_lock.lock();
        let mut next = (*self.snapshot_locked()).clone();
        if apply(&mut next, self.clock.now_millis())? {
            self.commit(next)?;
        }
        Ok(())
    }
}

impl Backend for DocumentBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.decode(&self.snapshot(), key)
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        Ok(self.snapshot().types.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|root, now| {
            root.insert(key.to_string(), &value, now)?;
            Ok(true)
        })
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.mutate(|root, now| {
            for (key, value) in &entries {
                root.insert(key.clone(), value, now)?;
            }
            Ok(!entries.is_empty())
        })
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot_locked();
        if let Some(value) = self.decode(&current, key)? {
            return Ok(value);
        }

        let value = supplier()?;
        let mut next = (*current).clone();
        next.insert(key.to_string(), &value, self.clock.now_millis())?;
        self.commit(next)?;
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
        let value = match self.decode(&current, key)? {
            Some(existing) => update(existing)?,
            None => supplier()?,
        };

        let mut next = (*current).clone();
        next.insert(key.to_string(), &value, self.clock.now_millis())?;
        self.commit(next)?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|root, _| Ok(root.remove(key)))
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.mutate(|root, _| {
            let mut changed = false;
            for key in keys {
                changed |= root.remove(key);
            }
            Ok(changed)
        })
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
        self.commit(DocumentRoot::default())
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .snapshot()
            .creation_dates
            .get(key)
            .map(|created| self.clock.age_of(*created)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_document_round_trip_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        {
            let cache = DocumentBackend::open(&path);
            cache.put_as("name", "cairn".to_string()).unwrap();
            cache.put_as("raw", vec![0u8, 255, 7]).unwrap();
            cache.put_as("n", 12i64).unwrap();
        }

        let cache = DocumentBackend::open(&path);
        assert_eq!(cache.get_as::<String>("name").unwrap().as_deref(), Some("cairn"));
        assert_eq!(cache.get_as::<Vec<u8>>("raw").unwrap(), Some(vec![0, 255, 7]));
        assert_eq!(cache.get_as::<i64>("n").unwrap(), Some(12));
        assert_eq!(cache.get_type("n").unwrap().as_deref(), Some("i64"));
        assert_eq!(cache.size().unwrap(), 3);
    }

    #[test]
    fn test_document_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cache = DocumentBackend::open(&path).with_clock(clock);

        cache.put_as("k", 5u32).unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["data"]["k"], 5);
        assert_eq!(doc["types"]["k"], "u32");
        assert_eq!(doc["creationDates"]["k"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_document_blank_and_garbled_start_empty() {
        let dir = TempDir::new().unwrap();

        let blank = dir.path().join("blank.json");
        fs::write(&blank, b"   \n").unwrap();
        let cache = DocumentBackend::open(&blank).with_retry(quick());
        assert!(cache.is_empty().unwrap());

        let garbled = dir.path().join("garbled.json");
        fs::write(&garbled, b"{\"data\": {\"k\": ").unwrap();
        let cache = DocumentBackend::open(&garbled).with_retry(quick());
        assert!(cache.is_empty().unwrap());

        // a fresh write replaces the garbled file
        cache.put_as("k", 1i32).unwrap();
        let reopened = DocumentBackend::open(&garbled);
        assert_eq!(reopened.get_as::<i32>("k").unwrap(), Some(1));
    }

    #[test]
    fn test_document_unresolved_type_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(
            &path,
            br#"{"data":{"k":{"x":1}},"types":{"k":"app.Missing"},"creationDates":{"k":0}}"#,
        )
        .unwrap();

        let cache = DocumentBackend::open(&path);
        assert!(matches!(cache.get("k"), Err(Error::UnresolvedType(_))));
        assert!(matches!(
            cache.compute_if_absent("k", &mut || Ok(Value::new(1i32))),
            Err(Error::UnresolvedType(_))
        ));
        assert_eq!(cache.get_type("k").unwrap().as_deref(), Some("app.Missing"));
    }

    #[test]
    fn test_document_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = DocumentBackend::open(&path);
        cache.put_as("a", 1i64).unwrap();
        cache.put_as("b", 2i64).unwrap();

        cache.remove("a").unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
        assert_eq!(cache.size().unwrap(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
        assert!(DocumentBackend::open(&path).is_empty().unwrap());
    }

    #[test]
    fn test_document_update_invokes_one_function() {
        let dir = TempDir::new().unwrap();
        let cache = DocumentBackend::open(dir.path().join("cache.json"));

        let created = cache
            .compute_if_absent_or_update_as("hits", || 1u64, |_| panic!("update on absent key"))
            .unwrap();
        let updated = cache
            .compute_if_absent_or_update_as("hits", || panic!("supplier on present key"), |n: u64| n + 1)
            .unwrap();

        assert_eq!((created, updated), (1, 2));
    }

    #[test]
    fn test_document_two_instances_share_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.json");
        let first = DocumentBackend::open(&path);
        let second = DocumentBackend::open(&path);

        std::thread::scope(|scope| {
            for (name, cache) in [("a", &first), ("b", &second)] {
                for worker in 0..3 {
                    scope.spawn(move || {
                        for i in 0..50 {
                            cache
                                .put_as(&format!("{}-{}-{}", name, worker, i), i as i64)
                                .unwrap();
                        }
                    });
                }
            }
        });

        // the last committed document wins; it is always complete
        let reopened = DocumentBackend::open(&path).with_retry(quick());
        assert!(reopened.size().unwrap() >= 150);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_document_reload_sees_external_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let reader = DocumentBackend::open(&path);
        assert!(reader.is_empty().unwrap());

        DocumentBackend::open(&path).put_as("k", 3i32).unwrap();
        assert!(reader.is_empty().unwrap());

        reader.reload();
        assert_eq!(reader.get_as::<i32>("k").unwrap(), Some(3));
    }
}
