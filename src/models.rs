//! Data model shared by the engine, the wire and the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{DbError, Result};

/// Longest bin name the server accepts, in bytes.
pub const MAX_BIN_NAME_LEN: usize = 15;

/// Scalar value held in a bin, used as a record key or produced by a stream function.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Order-preserving, type-tagged byte encoding of keyable values.
    ///
    /// Strings are length-prefixed so one encoding is never a prefix of another
    /// value's encoding; integers flip the sign bit so big-endian bytes sort
    /// numerically.
    pub(crate) fn encode(&self) -> Option<Vec<u8>> {
        match self {
            Value::Int(v) => {
                let mut out = Vec::with_capacity(9);
                out.push(b'i');
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                Some(out)
            }
            Value::Str(s) => {
                let mut out = Vec::with_capacity(5 + s.len());
                out.push(b's');
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
                Some(out)
            }
            Value::Nil | Value::Bool(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Record identity: (namespace, set, user key).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: String,
    pub set: String,
    pub user_key: Value,
}

impl Key {
    pub fn new(namespace: impl Into<String>, set: impl Into<String>, user_key: impl Into<Value>) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            user_key: user_key.into(),
        }
    }

    /// Storage key: the set prefix followed by the encoded user key.
    pub fn digest(&self) -> Result<Vec<u8>> {
        let mut digest = set_prefix(&self.namespace, &self.set)?;
        let encoded = self.user_key.encode().ok_or_else(|| {
            DbError::InvalidKey(format!(
                "user key must be int or string, got {}",
                self.user_key.type_name()
            ))
        })?;
        digest.extend_from_slice(&encoded);
        Ok(digest)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.set, self.user_key)
    }
}

/// Prefix shared by every digest in one (namespace, set).
pub(crate) fn set_prefix(namespace: &str, set: &str) -> Result<Vec<u8>> {
    if namespace.is_empty() {
        return Err(DbError::InvalidKey("namespace must not be empty".into()));
    }
    if namespace.contains('\0') || set.contains('\0') {
        return Err(DbError::InvalidKey("namespace and set must not contain NUL".into()));
    }
    let mut prefix = Vec::with_capacity(namespace.len() + set.len() + 2);
    prefix.extend_from_slice(namespace.as_bytes());
    prefix.push(0);
    prefix.extend_from_slice(set.as_bytes());
    prefix.push(0);
    Ok(prefix)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DbError::InvalidBin("bin name must not be empty".into()));
        }
        if self.name.len() > MAX_BIN_NAME_LEN {
            return Err(DbError::InvalidBin(format!(
                "bin name {:?} exceeds {MAX_BIN_NAME_LEN} bytes",
                self.name
            )));
        }
        Ok(())
    }
}

/// Stored record: ordered bins plus write metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub bins: Vec<Bin>,
    pub generation: u32,
    pub last_update: DateTime<Utc>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bins.iter().find(|b| b.name == name).map(|b| &b.value)
    }

    /// Applies a write: replaces existing bins in place, appends new ones and
    /// drops bins written as nil. Bumps the generation.
    pub(crate) fn apply(&mut self, bins: &[Bin]) {
        for bin in bins {
            let pos = self.bins.iter().position(|b| b.name == bin.name);
            match (pos, bin.value.is_nil()) {
                (Some(i), true) => {
                    self.bins.remove(i);
                }
                (Some(i), false) => self.bins[i].value = bin.value.clone(),
                (None, true) => {}
                (None, false) => self.bins.push(bin.clone()),
            }
        }
        self.generation = self.generation.saturating_add(1);
        self.last_update = Utc::now();
    }

    /// Copy of the record restricted to the named bins.
    pub fn project(&self, names: &[String]) -> Record {
        Record {
            bins: self
                .bins
                .iter()
                .filter(|b| names.iter().any(|n| *n == b.name))
                .cloned()
                .collect(),
            generation: self.generation,
            last_update: self.last_update,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(gen:{}),(exp:0),(bins:", self.generation)?;
        for (i, bin) in self.bins.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "({}:{})", bin.name, bin.value)?;
        }
        f.write_str(")")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: Key,
    pub record: Record,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    String,
    Numeric,
}

impl IndexType {
    /// Whether a bin value of this shape is held by an index of this type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (IndexType::String, Value::Str(_)) | (IndexType::Numeric, Value::Int(_))
        )
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::String => f.write_str("STRING"),
            IndexType::Numeric => f.write_str("NUMERIC"),
        }
    }
}

/// Definition of a secondary index over one bin of one set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub namespace: String,
    pub set: String,
    pub name: String,
    pub bin: String,
    pub index_type: IndexType,
}

impl IndexSpec {
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        name: impl Into<String>,
        bin: impl Into<String>,
        index_type: IndexType,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            name: name.into(),
            bin: bin.into(),
            index_type,
        }
    }
}

/// Query predicate, served by a secondary index on `bin`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Equal { bin: String, value: Value },
    /// Inclusive integer range.
    Range { bin: String, begin: i64, end: i64 },
}

impl Filter {
    pub fn equal(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equal {
            bin: bin.into(),
            value: value.into(),
        }
    }

    pub fn range(bin: impl Into<String>, begin: i64, end: i64) -> Self {
        Filter::Range {
            bin: bin.into(),
            begin,
            end,
        }
    }

    pub fn bin(&self) -> &str {
        match self {
            Filter::Equal { bin, .. } | Filter::Range { bin, .. } => bin,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Statement {
    pub namespace: String,
    pub set: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_names: Option<Vec<String>>,
}

impl Statement {
    pub fn new(namespace: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            filter: None,
            bin_names: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_bins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bin_names = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Stream function invocation attached to an aggregate query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UdfCall {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl UdfCall {
    pub fn new(module: impl Into<String>, function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args,
        }
    }
}

/// Progress of an asynchronous server-side job (index build, module compile).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Complete,
    Failed(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CursorId(pub Uuid);

impl CursorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CursorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One item produced by a cursor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Row {
    Record(KeyedRecord),
    Value(Value),
}

/// A page of cursor output; `done` means the cursor has nothing further.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub rows: Vec<Row>,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(bins: Vec<Bin>) -> Record {
        Record {
            bins,
            generation: 1,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_record_display_matches_bin_order() {
        let rec = record(vec![Bin::new("username", "Mary"), Bin::new("password", "ghjks")]);
        assert_eq!(
            rec.to_string(),
            "(gen:1),(exp:0),(bins:(username:Mary),(password:ghjks))"
        );
    }

    #[test]
    fn test_apply_merges_bins_and_bumps_generation() {
        let mut rec = record(vec![Bin::new("username", "Mary"), Bin::new("password", "ghjks")]);
        rec.apply(&[
            Bin::new("password", "new"),
            Bin::new("email", "m@x"),
            Bin::new("username", Value::Nil),
        ]);
        assert_eq!(rec.generation, 2);
        let names: Vec<&str> = rec.bins.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["password", "email"]);
        assert_eq!(rec.get("password"), Some(&Value::from("new")));
    }

    #[test]
    fn test_digest_distinguishes_key_types() {
        let as_str = Key::new("test", "profile", "1").digest().unwrap();
        let as_int = Key::new("test", "profile", 1i64).digest().unwrap();
        assert_ne!(as_str, as_int);

        let err = Key::new("test", "profile", true).digest().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidKey);
    }

    #[test]
    fn test_int_encoding_sorts_numerically() {
        let a = Value::Int(-5).encode().unwrap();
        let b = Value::Int(3).encode().unwrap();
        let c = Value::Int(300).encode().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_bin_name_limit() {
        assert!(Bin::new("username", "x").validate().is_ok());
        assert!(Bin::new("", "x").validate().is_err());
        assert!(Bin::new("a_very_long_bin_name", "x").validate().is_err());
    }

    #[test]
    fn test_value_wire_shape_is_untagged() {
        let json = serde_json::to_string(&vec![
            Value::Nil,
            Value::from(true),
            Value::from(7i64),
            Value::from("Mary"),
        ])
        .unwrap();
        assert_eq!(json, r#"[null,true,7,"Mary"]"#);
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[3], Value::from("Mary"));
    }
}
