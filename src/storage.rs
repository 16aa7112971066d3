use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::Result;
use crate::models::{set_prefix, Bin, IndexSpec, Key, KeyedRecord, Record};

/// Persisted secondary index definition; `built` flips once the initial
/// scan has finished, so an interrupted build is redone on open.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredIndex {
    pub spec: IndexSpec,
    pub built: bool,
}

/// Persisted stream module source, keyed by file name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredModule {
    pub file_name: String,
    pub source: String,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a write, used to keep secondary indexes in step.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub digest: Vec<u8>,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

#[derive(Clone)] // Sled handles are cheap to clone and thread-safe
pub struct Storage {
    db: Db,
    // - records: digest -> KeyedRecord JSON
    // - catalog: "index/<ns>/<name>" -> StoredIndex JSON
    // - udfs: file name -> StoredModule JSON
    // - one "sindex/<ns>/<name>" tree per secondary index
    records_tree: sled::Tree,
    catalog_tree: sled::Tree,
    udf_tree: sled::Tree,
}

impl Storage {
    /// Open or create the sled database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let records_tree = db.open_tree("records")?;
        let catalog_tree = db.open_tree("catalog")?;
        let udf_tree = db.open_tree("udfs")?;
        Ok(Self {
            db,
            records_tree,
            catalog_tree,
            udf_tree,
        })
    }

    /// Write bins to a record, creating it if needed. A write that leaves no
    /// bins deletes the record.
    pub fn put_record(&self, key: &Key, bins: &[Bin]) -> Result<WriteOutcome> {
        let digest = key.digest()?;
        let before = self.record_by_digest(&digest)?.map(|kr| kr.record);

        let mut record = before.clone().unwrap_or_else(|| Record {
            bins: Vec::new(),
            generation: 0,
            last_update: Utc::now(),
        });
        record.apply(bins);

        let after = if record.bins.is_empty() {
            self.records_tree.remove(&digest)?;
            None
        } else {
            let stored = KeyedRecord {
                key: key.clone(),
                record: record.clone(),
            };
            self.records_tree.insert(&digest, serde_json::to_vec(&stored)?)?;
            Some(record)
        };

        Ok(WriteOutcome { digest, before, after })
    }

    pub fn get_record(&self, key: &Key) -> Result<Option<Record>> {
        let digest = key.digest()?;
        Ok(self.record_by_digest(&digest)?.map(|kr| kr.record))
    }

    pub fn delete_record(&self, key: &Key) -> Result<WriteOutcome> {
        let digest = key.digest()?;
        let before = match self.records_tree.remove(&digest)? {
            Some(bytes) => Some(serde_json::from_slice::<KeyedRecord>(&bytes)?.record),
            None => None,
        };
        Ok(WriteOutcome {
            digest,
            before,
            after: None,
        })
    }

    pub fn record_by_digest(&self, digest: &[u8]) -> Result<Option<KeyedRecord>> {
        match self.records_tree.get(digest)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Digests of every record in a set, in storage order.
    pub fn set_digests(&self, namespace: &str, set: &str) -> Result<Vec<Vec<u8>>> {
        let prefix = set_prefix(namespace, set)?;
        let mut digests = Vec::new();
        for item in self.records_tree.scan_prefix(prefix).keys() {
            digests.push(item?.to_vec());
        }
        Ok(digests)
    }

    /// Distinct (namespace, set) pairs that currently hold records.
    pub fn sets(&self) -> Result<BTreeSet<(String, String)>> {
        let mut sets = BTreeSet::new();
        for item in self.records_tree.iter().keys() {
            let digest = item?;
            let mut parts = digest.splitn(3, |b| *b == 0);
            if let (Some(ns), Some(set)) = (parts.next(), parts.next()) {
                sets.insert((
                    String::from_utf8_lossy(ns).into_owned(),
                    String::from_utf8_lossy(set).into_owned(),
                ));
            }
        }
        Ok(sets)
    }

    pub fn record_count(&self) -> usize {
        self.records_tree.len()
    }

    // --- Catalog: secondary index definitions ---

    pub fn save_index(&self, stored: &StoredIndex) -> Result<()> {
        let key = catalog_key(&stored.spec.namespace, &stored.spec.name);
        self.catalog_tree.insert(key, serde_json::to_vec(stored)?)?;
        Ok(())
    }

    pub fn load_indexes(&self) -> Result<Vec<StoredIndex>> {
        let mut indexes = Vec::new();
        for item in self.catalog_tree.scan_prefix("index/") {
            let (_, bytes) = item?;
            indexes.push(serde_json::from_slice(&bytes)?);
        }
        Ok(indexes)
    }

    /// Entry tree of one secondary index.
    pub fn index_tree(&self, namespace: &str, name: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(index_tree_name(namespace, name))?)
    }

    /// Remove an index definition and its entries.
    pub fn drop_index(&self, namespace: &str, name: &str) -> Result<()> {
        self.catalog_tree.remove(catalog_key(namespace, name))?;
        self.db.drop_tree(index_tree_name(namespace, name))?;
        Ok(())
    }

    // --- Stream module sources ---

    pub fn save_module(&self, module: &StoredModule) -> Result<()> {
        self.udf_tree
            .insert(module.file_name.as_bytes(), serde_json::to_vec(module)?)?;
        Ok(())
    }

    pub fn load_modules(&self) -> Result<Vec<StoredModule>> {
        let mut modules = Vec::new();
        for item in self.udf_tree.iter() {
            let (_, bytes) = item?;
            modules.push(serde_json::from_slice(&bytes)?);
        }
        Ok(modules)
    }

    pub fn remove_module(&self, file_name: &str) -> Result<bool> {
        Ok(self.udf_tree.remove(file_name.as_bytes())?.is_some())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn catalog_key(namespace: &str, name: &str) -> String {
    format!("index/{namespace}/{name}")
}

fn index_tree_name(namespace: &str, name: &str) -> String {
    format!("sindex/{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexType, Value};
    use tempfile::tempdir;

    #[test]
    fn test_put_get_and_generation() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let key = Key::new("test", "profile", "4");

        let first = storage
            .put_record(&key, &[Bin::new("username", "Mary"), Bin::new("password", "ghjks")])
            .expect("put");
        assert!(first.before.is_none());
        assert_eq!(first.after.as_ref().map(|r| r.generation), Some(1));

        storage
            .put_record(&key, &[Bin::new("password", "changed")])
            .expect("second put");
        let rec = storage.get_record(&key).expect("get").expect("present");
        assert_eq!(rec.generation, 2);
        assert_eq!(rec.get("username"), Some(&Value::from("Mary")));
        assert_eq!(rec.get("password"), Some(&Value::from("changed")));
    }

    #[test]
    fn test_sets_are_isolated_by_prefix() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        storage
            .put_record(&Key::new("test", "profile", "1"), &[Bin::new("username", "Charlie")])
            .unwrap();
        storage
            .put_record(&Key::new("test", "profile2", "1"), &[Bin::new("username", "Other")])
            .unwrap();

        assert_eq!(storage.set_digests("test", "profile").unwrap().len(), 1);
        let sets = storage.sets().unwrap();
        assert!(sets.contains(&("test".to_string(), "profile2".to_string())));
        assert_eq!(storage.record_count(), 2);
    }

    #[test]
    fn test_delete_and_clearing_all_bins() {
        let dir = tempdir().expect("temp");
        let storage = Storage::open(dir.path()).expect("open");
        let key = Key::new("test", "profile", 9i64);
        storage.put_record(&key, &[Bin::new("username", "Temp")]).unwrap();

        let outcome = storage.put_record(&key, &[Bin::new("username", Value::Nil)]).unwrap();
        assert!(outcome.after.is_none());
        assert!(storage.get_record(&key).unwrap().is_none());

        storage.put_record(&key, &[Bin::new("username", "Again")]).unwrap();
        let deleted = storage.delete_record(&key).unwrap();
        assert!(deleted.before.is_some());
        assert!(storage.delete_record(&key).unwrap().before.is_none());
    }

    #[test]
    fn test_catalog_and_modules_persist_across_reopen() {
        let dir = tempdir().expect("temp");
        {
            let storage = Storage::open(dir.path()).expect("open");
            storage
                .save_index(&StoredIndex {
                    spec: IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String),
                    built: true,
                })
                .unwrap();
            storage
                .save_module(&StoredModule {
                    file_name: "profile.udf".into(),
                    source: "function f()\nend\n".into(),
                    registered_at: Utc::now(),
                })
                .unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).expect("reopen");
        let indexes = storage.load_indexes().unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].built);
        assert_eq!(storage.load_modules().unwrap()[0].file_name, "profile.udf");

        storage.drop_index("test", "profileindex").unwrap();
        assert!(storage.load_indexes().unwrap().is_empty());
        assert!(storage.remove_module("profile.udf").unwrap());
    }
}
