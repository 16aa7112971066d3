//! Secondary indexes: definitions, entry maintenance and asynchronous builds.
//!
//! Each index owns a sled tree whose keys are `encode(value) ++ digest`, so an
//! equality lookup is a prefix scan and a numeric range is a key range scan.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::error::{DbError, Result};
use crate::models::{set_prefix, Bin, Filter, IndexSpec, IndexType, Key, TaskStatus, Value};
use crate::storage::{Storage, StoredIndex, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Building,
    Ready,
    Failed(String),
}

impl IndexState {
    pub fn as_task_status(&self) -> TaskStatus {
        match self {
            IndexState::Building => TaskStatus::InProgress,
            IndexState::Ready => TaskStatus::Complete,
            IndexState::Failed(reason) => TaskStatus::Failed(reason.clone()),
        }
    }
}

/// One live secondary index.
pub struct SecondaryIndex {
    spec: IndexSpec,
    tree: sled::Tree,
    state: RwLock<IndexState>,
    dropped: AtomicBool,
}

impl SecondaryIndex {
    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn state(&self) -> IndexState {
        self.state.read().clone()
    }

    fn covers(&self, namespace: &str, set: &str) -> bool {
        self.spec.namespace == namespace && self.spec.set == set
    }

    fn insert_entry(&self, value: &Value, digest: &[u8]) -> Result<()> {
        if let Some(entry) = entry_key(self.spec.index_type, value, digest) {
            self.tree.insert(entry, &[])?;
        }
        Ok(())
    }

    fn remove_entry(&self, value: &Value, digest: &[u8]) -> Result<()> {
        if let Some(entry) = entry_key(self.spec.index_type, value, digest) {
            self.tree.remove(entry)?;
        }
        Ok(())
    }

    /// Digests whose indexed value satisfies the filter. Entries may be stale
    /// relative to concurrent writes; callers re-check the record.
    fn lookup(&self, filter: &Filter) -> Result<Vec<Vec<u8>>> {
        let mut digests = Vec::new();
        match filter {
            Filter::Equal { value, .. } => {
                let Some(prefix) = value.encode() else {
                    return Ok(digests);
                };
                for item in self.tree.scan_prefix(&prefix).keys() {
                    digests.push(item?[prefix.len()..].to_vec());
                }
            }
            Filter::Range { begin, end, .. } => {
                if begin > end {
                    return Ok(digests);
                }
                let encoded_len = 9;
                let lo = Value::Int(*begin).encode().unwrap_or_default();
                let entries: Box<dyn Iterator<Item = sled::Result<sled::IVec>>> = if *end == i64::MAX {
                    Box::new(self.tree.range(lo..).keys())
                } else {
                    let hi = Value::Int(*end + 1).encode().unwrap_or_default();
                    Box::new(self.tree.range(lo..hi).keys())
                };
                for item in entries {
                    digests.push(item?[encoded_len..].to_vec());
                }
            }
        }
        Ok(digests)
    }
}

fn entry_key(index_type: IndexType, value: &Value, digest: &[u8]) -> Option<Vec<u8>> {
    if !index_type.accepts(value) {
        return None;
    }
    let mut entry = value.encode()?;
    entry.extend_from_slice(digest);
    Some(entry)
}

/// Registry of secondary indexes, keyed by (namespace, index name).
pub struct IndexCatalog {
    storage: Storage,
    indexes: RwLock<HashMap<(String, String), Arc<SecondaryIndex>>>,
    builds: Mutex<Vec<thread::JoinHandle<()>>>,
    // Held across a record write and its index maintenance, and by builds
    // for each entry they add.
    writes: Arc<Mutex<()>>,
}

impl IndexCatalog {
    /// Load persisted definitions; indexes whose build never finished are rebuilt.
    pub fn load(storage: Storage) -> Result<Self> {
        let catalog = Self {
            storage: storage.clone(),
            indexes: RwLock::new(HashMap::new()),
            builds: Mutex::new(Vec::new()),
            writes: Arc::new(Mutex::new(())),
        };
        for stored in storage.load_indexes()? {
            let tree = storage.index_tree(&stored.spec.namespace, &stored.spec.name)?;
            let state = if stored.built {
                IndexState::Ready
            } else {
                tree.clear()?;
                IndexState::Building
            };
            let index = Arc::new(SecondaryIndex {
                spec: stored.spec.clone(),
                tree,
                state: RwLock::new(state.clone()),
                dropped: AtomicBool::new(false),
            });
            catalog.indexes.write().insert(
                (stored.spec.namespace.clone(), stored.spec.name.clone()),
                index.clone(),
            );
            if state == IndexState::Building {
                info!(index = %stored.spec.name, "resuming interrupted index build");
                catalog.spawn_build(index);
            }
        }
        Ok(catalog)
    }

    /// Define an index and start building it. Re-creating an identical
    /// definition is a no-op; reusing the name for another definition fails.
    pub fn create(&self, spec: IndexSpec) -> Result<()> {
        set_prefix(&spec.namespace, &spec.set)?;
        Bin::new(spec.bin.clone(), Value::Nil).validate()?;
        if spec.name.is_empty() {
            return Err(DbError::InvalidCommand("index name must not be empty".into()));
        }

        let key = (spec.namespace.clone(), spec.name.clone());
        let mut indexes = self.indexes.write();
        if let Some(existing) = indexes.get(&key) {
            if existing.spec == spec {
                debug!(index = %spec.name, "index already defined");
                return Ok(());
            }
            return Err(DbError::IndexAlreadyExists(spec.name));
        }

        let tree = self.storage.index_tree(&spec.namespace, &spec.name)?;
        tree.clear()?;
        self.storage.save_index(&StoredIndex {
            spec: spec.clone(),
            built: false,
        })?;
        let index = Arc::new(SecondaryIndex {
            spec,
            tree,
            state: RwLock::new(IndexState::Building),
            dropped: AtomicBool::new(false),
        });
        indexes.insert(key, index.clone());
        drop(indexes);

        info!(index = %index.spec.name, bin = %index.spec.bin, "index build started");
        self.spawn_build(index);
        Ok(())
    }

    pub fn status(&self, namespace: &str, name: &str) -> Result<TaskStatus> {
        self.indexes
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|index| index.state().as_task_status())
            .ok_or_else(|| DbError::IndexNotFound(format!("{namespace}.{name}")))
    }

    pub fn drop_index(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self
            .indexes
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| DbError::IndexNotFound(format!("{namespace}.{name}")))?;
        removed.dropped.store(true, Ordering::SeqCst);
        self.storage.drop_index(namespace, name)?;
        info!(index = %name, "index dropped");
        Ok(())
    }

    /// Serialise a record write with index maintenance and builds. Hold the
    /// guard from the storage write through [`IndexCatalog::on_write`].
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock()
    }

    /// Reflect a record write in every index over the record's set.
    pub fn on_write(&self, key: &Key, outcome: &WriteOutcome) -> Result<()> {
        let indexes: Vec<Arc<SecondaryIndex>> = self
            .indexes
            .read()
            .values()
            .filter(|i| i.covers(&key.namespace, &key.set))
            .cloned()
            .collect();

        for index in indexes {
            let bin = &index.spec.bin;
            let old = outcome.before.as_ref().and_then(|r| r.get(bin));
            let new = outcome.after.as_ref().and_then(|r| r.get(bin));
            if old == new {
                continue;
            }
            if let Some(old) = old {
                index.remove_entry(old, &outcome.digest)?;
            }
            if let Some(new) = new {
                index.insert_entry(new, &outcome.digest)?;
            }
        }
        Ok(())
    }

    /// Resolve a filter against a readable index over `namespace.set`.
    pub fn lookup(&self, namespace: &str, set: &str, filter: &Filter) -> Result<Vec<Vec<u8>>> {
        let wanted = match filter {
            Filter::Equal { value: Value::Str(_), .. } => IndexType::String,
            Filter::Equal { value: Value::Int(_), .. } | Filter::Range { .. } => IndexType::Numeric,
            Filter::Equal { value, .. } => {
                return Err(DbError::IndexNotFound(format!(
                    "{} values are not indexable",
                    value.type_name()
                )))
            }
        };

        let index = self
            .indexes
            .read()
            .values()
            .find(|i| i.covers(namespace, set) && i.spec.bin == filter.bin() && i.spec.index_type == wanted)
            .cloned()
            .ok_or_else(|| {
                DbError::IndexNotFound(format!("no {wanted} index on {namespace}.{set}({})", filter.bin()))
            })?;

        match index.state() {
            IndexState::Ready => index.lookup(filter),
            IndexState::Building => Err(DbError::IndexNotReadable(index.spec.name.clone())),
            IndexState::Failed(reason) => Err(DbError::IndexBuildFailed {
                name: index.spec.name.clone(),
                reason,
            }),
        }
    }

    /// Every index with its current build state, ordered by namespace and name.
    pub fn list(&self) -> Vec<(IndexSpec, IndexState)> {
        let mut all: Vec<(IndexSpec, IndexState)> = self
            .indexes
            .read()
            .values()
            .map(|i| (i.spec.clone(), i.state()))
            .collect();
        all.sort_by(|a, b| (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name)));
        all
    }

    fn spawn_build(&self, index: Arc<SecondaryIndex>) {
        let storage = self.storage.clone();
        let writes = self.writes.clone();
        let worker = index.clone();
        let spawned = thread::Builder::new()
            .name(format!("sindex-build-{}", index.spec.name))
            .spawn(move || {
                let result = build(&storage, &worker, &writes).and_then(|()| {
                    storage.save_index(&StoredIndex {
                        spec: worker.spec.clone(),
                        built: true,
                    })
                });
                match result {
                    Ok(()) => {
                        *worker.state.write() = IndexState::Ready;
                        info!(index = %worker.spec.name, entries = worker.tree.len(), "index build complete");
                    }
                    Err(err) => {
                        warn!(index = %worker.spec.name, error = %err, "index build failed");
                        *worker.state.write() = IndexState::Failed(err.to_string());
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                let mut builds = self.builds.lock();
                builds.retain(|h| !h.is_finished());
                builds.push(handle);
            }
            Err(err) => {
                *index.state.write() = IndexState::Failed(format!("could not start build: {err}"));
            }
        }
    }
}

impl Drop for IndexCatalog {
    /// Cancels running builds and waits for them, so no thread keeps the
    /// database open. Cancelled builds are not marked built and resume on
    /// the next load.
    fn drop(&mut self) {
        for index in self.indexes.read().values() {
            if index.state() == IndexState::Building {
                index.dropped.store(true, Ordering::SeqCst);
            }
        }
        for handle in self.builds.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Index every record of the set. Each entry is taken from the record's
/// current image under the write lock; writes after that see the index.
fn build(storage: &Storage, index: &SecondaryIndex, writes: &Mutex<()>) -> Result<()> {
    for digest in storage.set_digests(&index.spec.namespace, &index.spec.set)? {
        if index.dropped.load(Ordering::SeqCst) {
            return Err(DbError::IndexBuildFailed {
                name: index.spec.name.clone(),
                reason: "index dropped".into(),
            });
        }
        let _guard = writes.lock();
        let Some(stored) = storage.record_by_digest(&digest)? else {
            continue;
        };
        if let Some(value) = stored.record.get(&index.spec.bin) {
            index.insert_entry(value, &digest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bin;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn wait_ready(catalog: &IndexCatalog, namespace: &str, name: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while catalog.status(namespace, name).unwrap() == TaskStatus::InProgress {
            assert!(Instant::now() < deadline, "index build did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn put(storage: &Storage, catalog: &IndexCatalog, key: Key, bins: &[Bin]) {
        let _guard = catalog.lock_writes();
        let outcome = storage.put_record(&key, bins).unwrap();
        catalog.on_write(&key, &outcome).unwrap();
    }

    #[test]
    fn test_build_covers_existing_and_later_writes() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let catalog = IndexCatalog::load(storage.clone()).expect("catalog");

        put(&storage, &catalog, Key::new("test", "profile", "1"), &[Bin::new("username", "Charlie")]);
        catalog
            .create(IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String))
            .unwrap();
        wait_ready(&catalog, "test", "profileindex");
        put(&storage, &catalog, Key::new("test", "profile", "4"), &[Bin::new("username", "Mary")]);

        let hits = catalog
            .lookup("test", "profile", &Filter::equal("username", "Mary"))
            .unwrap();
        assert_eq!(hits, vec![Key::new("test", "profile", "4").digest().unwrap()]);
        assert_eq!(
            catalog
                .lookup("test", "profile", &Filter::equal("username", "Charlie"))
                .unwrap()
                .len(),
            1
        );
        assert!(catalog
            .lookup("test", "profile", &Filter::equal("username", "mary"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_updates_move_entries() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let catalog = IndexCatalog::load(storage.clone()).expect("catalog");
        catalog
            .create(IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String))
            .unwrap();
        wait_ready(&catalog, "test", "profileindex");

        let key = Key::new("test", "profile", "2");
        put(&storage, &catalog, key.clone(), &[Bin::new("username", "Bill")]);
        put(&storage, &catalog, key, &[Bin::new("username", "William")]);

        assert!(catalog
            .lookup("test", "profile", &Filter::equal("username", "Bill"))
            .unwrap()
            .is_empty());
        assert_eq!(
            catalog
                .lookup("test", "profile", &Filter::equal("username", "William"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_numeric_range_and_type_mismatch() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let catalog = IndexCatalog::load(storage.clone()).expect("catalog");
        for (pk, age) in [(1i64, 17i64), (2, 30), (3, 45), (4, -2)] {
            put(&storage, &catalog, Key::new("test", "people", pk), &[Bin::new("age", age)]);
        }
        put(&storage, &catalog, Key::new("test", "people", 5i64), &[Bin::new("age", "unknown")]);
        catalog
            .create(IndexSpec::new("test", "people", "ageindex", "age", IndexType::Numeric))
            .unwrap();
        wait_ready(&catalog, "test", "ageindex");

        let hits = catalog
            .lookup("test", "people", &Filter::range("age", 0, 40))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(
            catalog
                .lookup("test", "people", &Filter::range("age", i64::MIN, i64::MAX))
                .unwrap()
                .len(),
            4
        );

        let err = catalog
            .lookup("test", "people", &Filter::equal("age", "unknown"))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::IndexNotFound);
    }

    #[test]
    fn test_create_is_idempotent_but_rejects_conflicts() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let catalog = IndexCatalog::load(storage.clone()).expect("catalog");
        let spec = IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String);
        catalog.create(spec.clone()).unwrap();
        catalog.create(spec).unwrap();

        let err = catalog
            .create(IndexSpec::new("test", "profile", "profileindex", "password", IndexType::String))
            .unwrap_err();
        assert!(matches!(err, DbError::IndexAlreadyExists(_)));

        wait_ready(&catalog, "test", "profileindex");
        catalog.drop_index("test", "profileindex").unwrap();
        assert!(matches!(
            catalog.status("test", "profileindex"),
            Err(DbError::IndexNotFound(_))
        ));
        assert!(catalog.drop_index("test", "profileindex").is_err());
    }

    #[test]
    fn test_build_racing_writes_leaves_only_current_entries() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let catalog = Arc::new(IndexCatalog::load(storage.clone()).expect("catalog"));
        for i in 0..200 {
            put(&storage, &catalog, Key::new("test", "profile", i.to_string()), &[Bin::new("username", format!("u{i}"))]);
        }

        let writer = {
            let storage = storage.clone();
            let catalog = catalog.clone();
            thread::spawn(move || {
                for round in 0..20 {
                    for i in (0..200).step_by(7) {
                        let name = format!("r{round}-{i}");
                        put(&storage, &catalog, Key::new("test", "profile", i.to_string()), &[Bin::new("username", name)]);
                    }
                }
            })
        };
        catalog
            .create(IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String))
            .unwrap();
        writer.join().unwrap();
        wait_ready(&catalog, "test", "profileindex");

        let index = catalog
            .indexes
            .read()
            .get(&("test".to_string(), "profileindex".to_string()))
            .cloned()
            .unwrap();
        let digests = storage.set_digests("test", "profile").unwrap();
        assert_eq!(index.tree.len(), digests.len());
        for digest in digests {
            let stored = storage.record_by_digest(&digest).unwrap().unwrap();
            let current = stored.record.get("username").unwrap();
            let entry = entry_key(IndexType::String, current, &digest).unwrap();
            assert!(index.tree.contains_key(entry).unwrap(), "missing entry for {}", stored.key);
        }
    }

    #[test]
    fn test_ready_index_survives_reopen() {
        let dir = tempdir().expect("temp");
        {
            let storage = Storage::open(dir.path()).expect("open");
            let catalog = IndexCatalog::load(storage.clone()).expect("catalog");
            put(&storage, &catalog, Key::new("test", "profile", "4"), &[Bin::new("username", "Mary")]);
            catalog
                .create(IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String))
                .unwrap();
            wait_ready(&catalog, "test", "profileindex");
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).expect("reopen");
        let catalog = IndexCatalog::load(storage).expect("catalog");
        assert_eq!(catalog.status("test", "profileindex").unwrap(), TaskStatus::Complete);
        assert_eq!(
            catalog
                .lookup("test", "profile", &Filter::equal("username", "Mary"))
                .unwrap()
                .len(),
            1
        );
    }
}
