//! The authenticate walkthrough: register the profile module, index
//! `username`, load five profiles, then run a record query and a
//! password-check aggregation, printing as it goes.

use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::client::{Client, RecordSet, ResultSet};
use crate::config::Config;
use crate::error::{DbError, Result};
use crate::models::{Bin, Filter, IndexType, Key, Statement, Value};

pub const NAMESPACE: &str = "test";
pub const SET: &str = "profile";
pub const INDEX_NAME: &str = "profileindex";
pub const INDEX_BIN: &str = "username";
pub const UDF_FILE: &str = "profile.udf";
pub const MODULE: &str = "profile";
pub const NO_RESULTS: &str = "No results returned.";

/// (key, username, password)
pub const FIXTURE: [(&str, &str, &str); 5] = [
    ("1", "Charlie", "cpass"),
    ("2", "Bill", "hknfpkj"),
    ("3", "Doug", "dj6554"),
    ("4", "Mary", "ghjks"),
    ("5", "Julie", "zzxzxvv"),
];

/// What a run printed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DemoReport {
    pub records: usize,
    pub results: Vec<Value>,
}

pub struct AuthenticateDemo {
    client: Option<Client>,
    udf_dir: PathBuf,
}

impl AuthenticateDemo {
    pub fn connect(config: &Config) -> Result<Self> {
        let client = Client::connect(config)?;
        info!(server = %config.base_url(), "connected");
        Ok(Self::with_client(client, &config.udf_dir))
    }

    pub fn with_client(client: Client, udf_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Some(client),
            udf_dir: udf_dir.into(),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DbError::Connection("demo connection already released".into()))
    }

    pub fn run(&self, out: &mut dyn Write) -> Result<DemoReport> {
        let client = self.client()?;
        let mut report = DemoReport::default();

        let udf_path = self.udf_dir.join(UDF_FILE);
        writeln!(out, "register {}", udf_path.display())?;
        client.register_udf(&udf_path)?.wait_till_complete()?;

        writeln!(out, "create index {INDEX_NAME}")?;
        client
            .create_index(NAMESPACE, SET, INDEX_NAME, INDEX_BIN, IndexType::String)?
            .wait_till_complete()?;

        writeln!(out, "add records")?;
        for (pk, username, password) in FIXTURE {
            client.put(
                &Key::new(NAMESPACE, SET, pk),
                &[Bin::new("username", username), Bin::new("password", password)],
            )?;
        }

        writeln!(out, "query on username")?;
        let stmt = Statement::new(NAMESPACE, SET).with_filter(Filter::equal(INDEX_BIN, "mary"));
        let mut records = client.query(&stmt)?;
        let printed = print_records(&mut records, out);
        let closed = records.close();
        report.records = printed?;
        closed?;

        writeln!(out, "query for Mary")?;
        let stmt = Statement::new(NAMESPACE, SET).with_filter(Filter::equal(INDEX_BIN, "Mary"));
        let mut results = client.query_aggregate(&stmt, MODULE, "check_password", vec![Value::from("ghjks")])?;
        let printed = print_results(&mut results, out);
        let closed = results.close();
        report.results = printed?;
        closed?;
        if report.results.is_empty() {
            writeln!(out, "{NO_RESULTS}")?;
        }

        info!(records = report.records, results = report.results.len(), "demo finished");
        Ok(report)
    }

    /// Release the connection. Safe to call again, and run on drop.
    pub fn teardown(&mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            client.close()?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

impl Drop for AuthenticateDemo {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(error = %err, "teardown failed");
        }
    }
}

fn print_records(records: &mut RecordSet<'_>, out: &mut dyn Write) -> Result<usize> {
    let mut count = 0;
    while let Some(found) = records.next_record()? {
        writeln!(out, "Record: {}", found.record)?;
        count += 1;
    }
    Ok(count)
}

fn print_results(results: &mut ResultSet<'_>, out: &mut dyn Write) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while let Some(value) = results.next_value()? {
        writeln!(out, "Result: {value}")?;
        values.push(value);
    }
    Ok(values)
}
