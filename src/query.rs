//! Query execution and the server-side cursor table.
//!
//! A filtered statement is served by a readable secondary index, an
//! unfiltered one scans its set. Record cursors snapshot the matching digests
//! and read records lazily per fetch; aggregate cursors hold the stream
//! function's output.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::indexing::IndexCatalog;
use crate::models::{set_prefix, Batch, CursorId, Filter, KeyedRecord, Record, Row, Statement, UdfCall, Value};
use crate::storage::Storage;
use crate::udf::ModuleRegistry;

enum Cursor {
    Records {
        digests: VecDeque<Vec<u8>>,
        filter: Option<Filter>,
        bin_names: Option<Vec<String>>,
    },
    Values(VecDeque<Value>),
}

struct OpenCursor {
    cursor: Cursor,
    last_used: Instant,
}

impl Cursor {
    fn is_drained(&self) -> bool {
        match self {
            Cursor::Records { digests, .. } => digests.is_empty(),
            Cursor::Values(values) => values.is_empty(),
        }
    }
}

/// Whether a record currently satisfies a filter. Index entries can trail
/// concurrent writes, so every index hit is re-checked against the record.
pub fn matches(filter: &Filter, record: &Record) -> bool {
    match filter {
        Filter::Equal { bin, value } => record.get(bin) == Some(value),
        Filter::Range { bin, begin, end } => {
            matches!(record.get(bin), Some(Value::Int(v)) if begin <= v && v <= end)
        }
    }
}

pub struct QueryEngine {
    storage: Storage,
    indexes: Arc<IndexCatalog>,
    modules: Arc<ModuleRegistry>,
    // The table lock only guards membership; each cursor has its own lock
    // for the duration of a fetch.
    cursors: Mutex<HashMap<CursorId, Arc<Mutex<OpenCursor>>>>,
}

impl QueryEngine {
    pub fn new(storage: Storage, indexes: Arc<IndexCatalog>, modules: Arc<ModuleRegistry>) -> Self {
        Self {
            storage,
            indexes,
            modules,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn select(&self, stmt: &Statement) -> Result<Vec<Vec<u8>>> {
        set_prefix(&stmt.namespace, &stmt.set)?;
        match &stmt.filter {
            Some(filter) => self.indexes.lookup(&stmt.namespace, &stmt.set, filter),
            None => self.storage.set_digests(&stmt.namespace, &stmt.set),
        }
    }

    fn read_matching(&self, digest: &[u8], filter: Option<&Filter>) -> Result<Option<KeyedRecord>> {
        let Some(found) = self.storage.record_by_digest(digest)? else {
            return Ok(None);
        };
        if filter.is_some_and(|f| !matches(f, &found.record)) {
            return Ok(None);
        }
        Ok(Some(found))
    }

    fn register(&self, cursor: Cursor) -> CursorId {
        let id = CursorId::new();
        let open = OpenCursor {
            cursor,
            last_used: Instant::now(),
        };
        self.cursors.lock().insert(id, Arc::new(Mutex::new(open)));
        id
    }

    /// Open a record cursor over the statement's matches.
    pub fn open_query(&self, stmt: &Statement) -> Result<CursorId> {
        let digests = self.select(stmt)?;
        debug!(namespace = %stmt.namespace, set = %stmt.set, candidates = digests.len(), "query opened");
        Ok(self.register(Cursor::Records {
            digests: digests.into(),
            filter: stmt.filter.clone(),
            bin_names: stmt.bin_names.clone(),
        }))
    }

    /// Run a stream function over the statement's matches and open a cursor
    /// over its results.
    pub fn open_aggregate(&self, stmt: &Statement, call: &UdfCall) -> Result<CursorId> {
        self.modules.check_call(call)?;
        let digests = self.select(stmt)?;
        let mut records = Vec::with_capacity(digests.len());
        for digest in &digests {
            if let Some(found) = self.read_matching(digest, stmt.filter.as_ref())? {
                records.push(found.record);
            }
        }
        let input = records.len();
        let values = self.modules.invoke(call, records)?;
        debug!(
            module = %call.module,
            function = %call.function,
            input,
            output = values.len(),
            "aggregate opened"
        );
        Ok(self.register(Cursor::Values(values.into())))
    }

    /// Next page of up to `max` rows.
    pub fn fetch(&self, id: CursorId, max: usize) -> Result<Batch> {
        let max = max.max(1);
        let entry = self
            .cursors
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DbError::CursorNotFound(id.0))?;
        let mut open = entry.lock();
        let OpenCursor { cursor, last_used } = &mut *open;

        let mut rows = Vec::new();
        match cursor {
            Cursor::Records {
                digests,
                filter,
                bin_names,
            } => {
                while rows.len() < max {
                    let Some(digest) = digests.pop_front() else {
                        break;
                    };
                    if let Some(mut found) = self.read_matching(&digest, filter.as_ref())? {
                        if let Some(names) = bin_names {
                            found.record = found.record.project(names);
                        }
                        rows.push(Row::Record(found));
                    }
                }
            }
            Cursor::Values(values) => {
                while rows.len() < max {
                    let Some(value) = values.pop_front() else {
                        break;
                    };
                    rows.push(Row::Value(value));
                }
            }
        }
        *last_used = Instant::now();
        Ok(Batch {
            rows,
            done: cursor.is_drained(),
        })
    }

    /// Release a cursor. Returns false when it was already gone.
    pub fn close(&self, id: CursorId) -> bool {
        let closed = self.cursors.lock().remove(&id).is_some();
        debug!(cursor = %id, closed, "cursor close");
        closed
    }

    /// Close cursors not fetched from for longer than `max_idle`. A cursor
    /// that is mid-fetch is kept.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|_, entry| {
            entry
                .try_lock()
                .map_or(true, |open| open.last_used.elapsed() <= max_idle)
        });
        let closed = before - cursors.len();
        if closed > 0 {
            info!(closed, open = cursors.len(), "idle cursors closed");
        }
        closed
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().len()
    }
}
