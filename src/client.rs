//! Client library: a connection handle, waitable server-side tasks and
//! scoped query cursors.
//!
//! Everything goes through the [`Backend`] seam, implemented by the HTTP
//! client ([`crate::remote::RemoteBackend`]) and by the in-process
//! [`crate::engine::Engine`].

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{DbError, Result};
use crate::models::{
    Batch, Bin, CursorId, IndexSpec, IndexType, Key, KeyedRecord, Record, Row, Statement, TaskStatus, UdfCall,
    Value,
};
use crate::remote::RemoteBackend;
use crate::udf::module_name;

/// Operations a record server offers to a client.
pub trait Backend: Send + Sync {
    fn register_udf(&self, file_name: &str, source: &str) -> Result<()>;
    fn udf_status(&self, file_name: &str) -> Result<TaskStatus>;
    fn remove_udf(&self, file_name: &str) -> Result<()>;
    fn create_index(&self, spec: &IndexSpec) -> Result<()>;
    fn index_status(&self, namespace: &str, name: &str) -> Result<TaskStatus>;
    fn drop_index(&self, namespace: &str, name: &str) -> Result<()>;
    fn put(&self, key: &Key, bins: &[Bin]) -> Result<()>;
    fn get(&self, key: &Key) -> Result<Option<Record>>;
    fn delete(&self, key: &Key) -> Result<bool>;
    fn open_query(&self, stmt: &Statement) -> Result<CursorId>;
    fn open_aggregate(&self, stmt: &Statement, call: &UdfCall) -> Result<CursorId>;
    fn fetch(&self, cursor: CursorId, max: usize) -> Result<Batch>;
    /// Must treat unknown cursors as already closed.
    fn close_cursor(&self, cursor: CursorId) -> Result<()>;
    fn info(&self, command: &str) -> Result<String>;
    /// Release the connection.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPolicy {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientPolicy {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size.max(1),
        }
    }
}

/// Connection handle. Operations fail once it is closed; closing is idempotent.
pub struct Client {
    backend: Box<dyn Backend>,
    policy: ClientPolicy,
    closed: bool,
}

impl Client {
    /// Connect to the record server named by `config`.
    pub fn connect(config: &Config) -> Result<Self> {
        let backend = RemoteBackend::connect(&config.host, config.port)?;
        Ok(Self::with_backend(backend, ClientPolicy::from(config)))
    }

    pub fn with_backend(backend: impl Backend + 'static, policy: ClientPolicy) -> Self {
        Self {
            backend: Box::new(backend),
            policy,
            closed: false,
        }
    }

    pub fn policy(&self) -> ClientPolicy {
        self.policy
    }

    fn backend(&self) -> Result<&dyn Backend> {
        if self.closed {
            return Err(DbError::Connection("client is closed".into()));
        }
        Ok(self.backend.as_ref())
    }

    /// Upload a stream module under the file's base name.
    pub fn register_udf(&self, path: &Path) -> Result<RegisterTask<'_>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DbError::InvalidCommand(format!("not a udf file path: {}", path.display())))?
            .to_string();
        let source = fs::read_to_string(path)?;
        self.backend()?.register_udf(&file_name, &source)?;
        debug!(file = %file_name, "udf uploaded");
        Ok(RegisterTask {
            client: self,
            file_name,
        })
    }

    pub fn remove_udf(&self, file_name: &str) -> Result<()> {
        self.backend()?.remove_udf(file_name)
    }

    pub fn create_index(
        &self,
        namespace: &str,
        set: &str,
        index_name: &str,
        bin: &str,
        index_type: IndexType,
    ) -> Result<IndexTask<'_>> {
        let spec = IndexSpec::new(namespace, set, index_name, bin, index_type);
        self.backend()?.create_index(&spec)?;
        Ok(IndexTask {
            client: self,
            namespace: namespace.to_string(),
            name: index_name.to_string(),
        })
    }

    pub fn drop_index(&self, namespace: &str, index_name: &str) -> Result<()> {
        self.backend()?.drop_index(namespace, index_name)
    }

    pub fn put(&self, key: &Key, bins: &[Bin]) -> Result<()> {
        self.backend()?.put(key, bins)
    }

    pub fn get(&self, key: &Key) -> Result<Option<Record>> {
        self.backend()?.get(key)
    }

    pub fn delete(&self, key: &Key) -> Result<bool> {
        self.backend()?.delete(key)
    }

    /// Open a record cursor. The cursor borrows the client and is closed on
    /// drop if not closed explicitly.
    pub fn query(&self, stmt: &Statement) -> Result<RecordSet<'_>> {
        let backend = self.backend()?;
        let id = backend.open_query(stmt)?;
        Ok(RecordSet(Cursor::new(backend, id, self.policy.batch_size)))
    }

    /// Open a cursor over `module.function(args)` applied to the statement's records.
    pub fn query_aggregate(
        &self,
        stmt: &Statement,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<ResultSet<'_>> {
        let backend = self.backend()?;
        let call = UdfCall::new(module, function, args);
        let id = backend.open_aggregate(stmt, &call)?;
        Ok(ResultSet(Cursor::new(backend, id, self.policy.batch_size)))
    }

    pub fn info(&self, command: &str) -> Result<String> {
        self.backend()?.info(command)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.backend.close()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "closing client failed");
        }
    }
}

/// Sleep-poll a server-side job until it leaves `InProgress`.
fn poll<F>(interval: Duration, mut status: F) -> Result<Option<String>>
where
    F: FnMut() -> Result<TaskStatus>,
{
    loop {
        match status()? {
            TaskStatus::Complete => return Ok(None),
            TaskStatus::Failed(reason) => return Ok(Some(reason)),
            TaskStatus::InProgress => thread::sleep(interval),
        }
    }
}

/// Pending module registration.
pub struct RegisterTask<'c> {
    client: &'c Client,
    file_name: String,
}

impl RegisterTask<'_> {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn query_status(&self) -> Result<TaskStatus> {
        self.client.backend()?.udf_status(&self.file_name)
    }

    /// Block until the module is compiled; a compile failure is returned as an error.
    pub fn wait_till_complete(&self) -> Result<()> {
        match poll(self.client.policy.poll_interval, || self.query_status())? {
            None => Ok(()),
            Some(reason) => Err(DbError::UdfCompile {
                module: module_name(&self.file_name).to_string(),
                reason,
            }),
        }
    }
}

/// Pending secondary index build.
pub struct IndexTask<'c> {
    client: &'c Client,
    namespace: String,
    name: String,
}

impl IndexTask<'_> {
    pub fn index_name(&self) -> &str {
        &self.name
    }

    pub fn query_status(&self) -> Result<TaskStatus> {
        self.client.backend()?.index_status(&self.namespace, &self.name)
    }

    /// Block until the index is readable; a failed build is returned as an error.
    pub fn wait_till_complete(&self) -> Result<()> {
        match poll(self.client.policy.poll_interval, || self.query_status())? {
            None => Ok(()),
            Some(reason) => Err(DbError::IndexBuildFailed {
                name: self.name.clone(),
                reason,
            }),
        }
    }
}

/// Server-held cursor with a local page buffer.
struct Cursor<'c> {
    backend: &'c dyn Backend,
    id: CursorId,
    buffer: VecDeque<Row>,
    done: bool,
    closed: bool,
    batch_size: usize,
}

impl<'c> Cursor<'c> {
    fn new(backend: &'c dyn Backend, id: CursorId, batch_size: usize) -> Self {
        Self {
            backend,
            id,
            buffer: VecDeque::new(),
            done: false,
            closed: false,
            batch_size,
        }
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(DbError::CursorClosed);
        }
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            let batch = self.backend.fetch(self.id, self.batch_size)?;
            self.done = batch.done;
            self.buffer.extend(batch.rows);
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        self.backend.close_cursor(self.id)
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(cursor = %self.id, error = %err, "closing cursor failed");
        }
    }
}

/// Lazy, forward-only sequence of query records.
pub struct RecordSet<'c>(Cursor<'c>);

impl RecordSet<'_> {
    pub fn id(&self) -> CursorId {
        self.0.id
    }

    pub fn next_record(&mut self) -> Result<Option<KeyedRecord>> {
        match self.0.next_row()? {
            Some(Row::Record(record)) => Ok(Some(record)),
            Some(Row::Value(_)) => Err(DbError::Protocol("record cursor produced a value".into())),
            None => Ok(None),
        }
    }

    /// Release the server cursor. Closing again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed
    }
}

impl Iterator for RecordSet<'_> {
    type Item = Result<KeyedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Lazy, forward-only sequence of stream function results.
pub struct ResultSet<'c>(Cursor<'c>);

impl ResultSet<'_> {
    pub fn id(&self) -> CursorId {
        self.0.id
    }

    pub fn next_value(&mut self) -> Result<Option<Value>> {
        match self.0.next_row()? {
            Some(Row::Value(value)) => Ok(Some(value)),
            Some(Row::Record(_)) => Err(DbError::Protocol("aggregate cursor produced a record".into())),
            None => Ok(None),
        }
    }

    /// Release the server cursor. Closing again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed
    }
}

impl Iterator for ResultSet<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}
