use crate::error::{Result, TransferError};
use crate::metadata::StoreIdentity;
use crate::store::{Database, Record, RecordKey, Rows, Schema, StoreBackend, TableName};
use crate::value::Mapping;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type Table = BTreeMap<RecordKey, Mapping>;

#[derive(Default)]
struct DatabaseState {
    version: RwLock<u32>,
    tables: RwLock<AHashMap<TableName, Table>>,
}

pub struct MemoryBackend {
    schema: Arc<Schema>,
    databases: RwLock<AHashMap<String, Arc<DatabaseState>>>,
}

impl MemoryBackend {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            databases: RwLock::new(AHashMap::new()),
        }
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exists(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Schema::tabletop())
    }
}

impl StoreBackend for MemoryBackend {
    type Database = MemoryDatabase;

    fn open(&self, name: &str, version: u32) -> Result<MemoryDatabase> {
        let state = {
            let mut databases = self.databases.write();
            databases.entry(name.to_string()).or_default().clone()
        };

        {
            let mut current = state.version.write();
            if *current > version {
                return Err(TransferError::StoreIo(format!(
                    "cannot open {} at version {}: already at version {}",
                    name, version, *current
                )));
            }
            *current = version;
        }

        Ok(MemoryDatabase {
            identity: StoreIdentity::new(name, version),
            schema: self.schema.clone(),
            state,
        })
    }

    fn delete_database(&self, name: &str) -> Result<()> {
        self.databases.write().remove(name);
        Ok(())
    }
}

pub struct MemoryDatabase {
    identity: StoreIdentity,
    schema: Arc<Schema>,
    state: Arc<DatabaseState>,
}

impl Database for MemoryDatabase {
    fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    fn key_path(&self, table: &str) -> &str {
        self.schema.key_path(table)
    }

    fn table_names(&self) -> Result<Vec<TableName>> {
        let mut names: Vec<TableName> = self.state.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn count(&self, table: &str) -> Result<u64> {
        Ok(self
            .state
            .tables
            .read()
            .get(table)
            .map_or(0, |rows| rows.len() as u64))
    }

    fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        let tables = self.state.tables.read();
        Ok(tables.get(table).and_then(|rows| rows.get(key)).map(|value| Record {
            table: table.to_string(),
            key: key.clone(),
            value: value.clone(),
        }))
    }

    fn put(&self, record: Record) -> Result<()> {
        let mut tables = self.state.tables.write();
        tables
            .entry(record.table)
            .or_default()
            .insert(record.key, record.value);
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Rows<'_>> {
        Ok(Box::new(MemoryCursor {
            state: self.state.clone(),
            table: table.to_string(),
            last: None,
            done: false,
        }))
    }
}

/// Resumes after the last key seen on every step, holding the lock only for
/// the duration of one lookup.
struct MemoryCursor {
    state: Arc<DatabaseState>,
    table: TableName,
    last: Option<RecordKey>,
    done: bool,
}

impl Iterator for MemoryCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let next = {
            let tables = self.state.tables.read();
            let rows = tables.get(&self.table)?;
            let lower = match &self.last {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            rows.range::<RecordKey, _>((lower, Bound::Unbounded))
                .next()
                .map(|(key, value)| (key.clone(), value.clone()))
        };

        match next {
            Some((key, value)) => {
                self.last = Some(key.clone());
                Some(Ok(Record {
                    table: self.table.clone(),
                    key,
                    value,
                }))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
