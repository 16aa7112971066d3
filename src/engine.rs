//! The record server's engine: storage, secondary indexes, stream modules and
//! cursors behind one cloneable handle, shared by the HTTP layer and by
//! in-process clients.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::Backend;
use crate::error::{DbError, Result};
use crate::indexing::IndexCatalog;
use crate::info;
use crate::models::{Batch, Bin, CursorId, IndexSpec, Key, Record, Statement, TaskStatus, UdfCall};
use crate::query::QueryEngine;
use crate::storage::Storage;
use crate::udf::ModuleRegistry;

struct EngineInner {
    storage: Storage,
    indexes: Arc<IndexCatalog>,
    modules: Arc<ModuleRegistry>,
    queries: QueryEngine,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the store at `path`, reloading index definitions and modules.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Storage::open(path.as_ref())?;
        let indexes = Arc::new(IndexCatalog::load(storage.clone())?);
        let modules = Arc::new(ModuleRegistry::load(storage.clone())?);
        let queries = QueryEngine::new(storage.clone(), indexes.clone(), modules.clone());
        info!(
            path = %path.as_ref().display(),
            records = storage.record_count(),
            indexes = indexes.list().len(),
            modules = modules.list().len(),
            "engine opened"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                storage,
                indexes,
                modules,
                queries,
            }),
        })
    }

    pub fn register_udf(&self, file_name: &str, source: &str) -> Result<()> {
        self.inner.modules.register(file_name, source)
    }

    pub fn udf_status(&self, file_name: &str) -> Result<TaskStatus> {
        self.inner.modules.status(file_name)
    }

    pub fn remove_udf(&self, file_name: &str) -> Result<()> {
        self.inner.modules.remove(file_name)
    }

    pub fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.inner.indexes.create(spec.clone())
    }

    pub fn index_status(&self, namespace: &str, name: &str) -> Result<TaskStatus> {
        self.inner.indexes.status(namespace, name)
    }

    pub fn drop_index(&self, namespace: &str, name: &str) -> Result<()> {
        self.inner.indexes.drop_index(namespace, name)
    }

    pub fn put(&self, key: &Key, bins: &[Bin]) -> Result<()> {
        if bins.is_empty() {
            return Err(DbError::InvalidBin("put needs at least one bin".into()));
        }
        for bin in bins {
            bin.validate()?;
        }
        let _guard = self.inner.indexes.lock_writes();
        let outcome = self.inner.storage.put_record(key, bins)?;
        self.inner.indexes.on_write(key, &outcome)?;
        debug!(key = %key, generation = outcome.after.as_ref().map(|r| r.generation), "put");
        Ok(())
    }

    pub fn get(&self, key: &Key) -> Result<Option<Record>> {
        self.inner.storage.get_record(key)
    }

    pub fn delete(&self, key: &Key) -> Result<bool> {
        let _guard = self.inner.indexes.lock_writes();
        let outcome = self.inner.storage.delete_record(key)?;
        self.inner.indexes.on_write(key, &outcome)?;
        Ok(outcome.before.is_some())
    }

    pub fn open_query(&self, stmt: &Statement) -> Result<CursorId> {
        self.inner.queries.open_query(stmt)
    }

    pub fn open_aggregate(&self, stmt: &Statement, call: &UdfCall) -> Result<CursorId> {
        self.inner.queries.open_aggregate(stmt, call)
    }

    pub fn fetch(&self, cursor: CursorId, max: usize) -> Result<Batch> {
        self.inner.queries.fetch(cursor, max)
    }

    /// Closing an unknown or already closed cursor is a no-op.
    pub fn close_cursor(&self, cursor: CursorId) {
        self.inner.queries.close(cursor);
    }

    pub fn open_cursors(&self) -> usize {
        self.inner.queries.open_cursors()
    }

    /// Close cursors left idle by clients that never closed them.
    pub fn close_idle_cursors(&self, max_idle: Duration) -> usize {
        self.inner.queries.close_idle(max_idle)
    }

    /// Answer an info command.
    pub fn info(&self, command: &str) -> Result<String> {
        let inner = &self.inner;
        match command {
            "build" => Ok(env!("CARGO_PKG_VERSION").to_string()),
            "namespaces" => {
                let mut namespaces: BTreeSet<String> =
                    inner.storage.sets()?.into_iter().map(|(ns, _)| ns).collect();
                namespaces.extend(inner.indexes.list().into_iter().map(|(spec, _)| spec.namespace));
                Ok(namespaces.into_iter().collect::<Vec<_>>().join(";"))
            }
            "sets" => {
                let mut entries = Vec::new();
                for (ns, set) in inner.storage.sets()? {
                    let objects = inner.storage.set_digests(&ns, &set)?.len();
                    entries.push(format!("ns={ns}:set={set}:objects={objects}"));
                }
                Ok(info::join(entries))
            }
            "sindex" => Ok(info::join(
                inner
                    .indexes
                    .list()
                    .iter()
                    .map(|(spec, state)| info::sindex_entry(spec, state)),
            )),
            "udf-list" => Ok(info::join(inner.modules.list().iter().map(info::udf_entry))),
            "statistics" => Ok(info::join([
                format!("records={}", inner.storage.record_count()),
                format!("indexes={}", inner.indexes.list().len()),
                format!("udfs={}", inner.modules.list().len()),
                format!("cursors={}", inner.queries.open_cursors()),
            ])),
            other => Err(DbError::InvalidCommand(format!(
                "{other:?} (expected one of {})",
                info::COMMANDS.join(", ")
            ))),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.storage.flush()
    }
}

impl Backend for Engine {
    fn register_udf(&self, file_name: &str, source: &str) -> Result<()> {
        Engine::register_udf(self, file_name, source)
    }

    fn udf_status(&self, file_name: &str) -> Result<TaskStatus> {
        Engine::udf_status(self, file_name)
    }

    fn remove_udf(&self, file_name: &str) -> Result<()> {
        Engine::remove_udf(self, file_name)
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        Engine::create_index(self, spec)
    }

    fn index_status(&self, namespace: &str, name: &str) -> Result<TaskStatus> {
        Engine::index_status(self, namespace, name)
    }

    fn drop_index(&self, namespace: &str, name: &str) -> Result<()> {
        Engine::drop_index(self, namespace, name)
    }

    fn put(&self, key: &Key, bins: &[Bin]) -> Result<()> {
        Engine::put(self, key, bins)
    }

    fn get(&self, key: &Key) -> Result<Option<Record>> {
        Engine::get(self, key)
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        Engine::delete(self, key)
    }

    fn open_query(&self, stmt: &Statement) -> Result<CursorId> {
        Engine::open_query(self, stmt)
    }

    fn open_aggregate(&self, stmt: &Statement, call: &UdfCall) -> Result<CursorId> {
        Engine::open_aggregate(self, stmt, call)
    }

    fn fetch(&self, cursor: CursorId, max: usize) -> Result<Batch> {
        Engine::fetch(self, cursor, max)
    }

    fn close_cursor(&self, cursor: CursorId) -> Result<()> {
        Engine::close_cursor(self, cursor);
        Ok(())
    }

    fn info(&self, command: &str) -> Result<String> {
        Engine::info(self, command)
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}
