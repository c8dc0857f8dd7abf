use crate::error::Result;
use crate::metadata::StoreIdentity;
use crate::value::{Mapping, Value};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TableName = String;

pub const MAPS: &str = "maps";
pub const STATES: &str = "states";
pub const TOKENS: &str = "tokens";

/// Primary key of a record. `1` and `"1"` are different keys, and every
/// integer key sorts before every string key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Integer(i64),
    String(String),
}

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        RecordKey::String(key.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RecordKey::String(s) => Some(s),
            RecordKey::Integer(_) => None,
        }
    }

    /// Reads the key out of a row's key-path field. Only strings and
    /// integers can key a row.
    pub fn from_field(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(RecordKey::String(s.clone())),
            Value::Integer(n) => Some(RecordKey::Integer(*n)),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Integer(n) => write!(f, "{}", n),
            RecordKey::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        RecordKey::String(key.to_string())
    }
}

impl From<i64> for RecordKey {
    fn from(key: i64) -> Self {
        RecordKey::Integer(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: TableName,
    pub key: RecordKey,
    pub value: Mapping,
}

impl Record {
    /// Keys a row by its key-path field. Returns `None` when the field is
    /// missing or not usable as a key.
    pub fn from_row(table: &str, value: Mapping, key_path: &str) -> Option<Self> {
        let key = value.get(key_path).and_then(RecordKey::from_field)?;
        Some(Self {
            table: table.to_string(),
            key,
            value,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }
}

/// Key paths per table.
#[derive(Debug, Clone)]
pub struct Schema {
    key_paths: AHashMap<TableName, String>,
    default_key_path: String,
}

impl Schema {
    pub fn new(default_key_path: impl Into<String>) -> Self {
        Self {
            key_paths: AHashMap::new(),
            default_key_path: default_key_path.into(),
        }
    }

    /// `maps` and `tokens` keyed by `id`, `states` by `mapId`.
    pub fn tabletop() -> Self {
        Self::new("id")
            .with_key_path(MAPS, "id")
            .with_key_path(TOKENS, "id")
            .with_key_path(STATES, "mapId")
    }

    pub fn with_key_path(mut self, table: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.key_paths.insert(table.into(), key_path.into());
        self
    }

    pub fn key_path(&self, table: &str) -> &str {
        self.key_paths
            .get(table)
            .map(String::as_str)
            .unwrap_or(&self.default_key_path)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::tabletop()
    }
}

pub type Rows<'a> = Box<dyn Iterator<Item = Result<Record>> + Send + 'a>;

pub trait Database: Send + Sync {
    fn identity(&self) -> &StoreIdentity;

    fn key_path(&self, table: &str) -> &str;

    /// Table names in store order.
    fn table_names(&self) -> Result<Vec<TableName>>;

    fn count(&self, table: &str) -> Result<u64>;

    fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>>;

    /// Inserts or replaces the record under its key.
    fn put(&self, record: Record) -> Result<()>;

    /// Ordered cursor over a table. Unknown tables yield nothing.
    fn scan(&self, table: &str) -> Result<Rows<'_>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub trait StoreBackend: Send + Sync + 'static {
    type Database: Database + 'static;

    /// Opens `name`, creating it or upgrading it to `version`.
    fn open(&self, name: &str, version: u32) -> Result<Self::Database>;

    /// Deletes `name`. Deleting a database that does not exist succeeds.
    fn delete_database(&self, name: &str) -> Result<()>;
}

/// Lazy, finite view over one table that can be restarted from the first row.
pub struct TableScan<'a, D: Database + ?Sized> {
    db: &'a D,
    table: &'a str,
}

impl<'a, D: Database + ?Sized> TableScan<'a, D> {
    pub fn new(db: &'a D, table: &'a str) -> Self {
        Self { db, table }
    }

    pub fn table(&self) -> &'a str {
        self.table
    }

    /// Starts a fresh pass from the first row.
    pub fn rows(&self) -> Result<Rows<'a>> {
        self.db.scan(self.table)
    }

    pub fn count_matching<F>(&self, mut predicate: F) -> Result<u64>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut count = 0;
        for row in self.rows()? {
            if predicate(&row?) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn collect_values(&self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        for row in self.rows()? {
            values.push(Value::Map(row?.value));
        }
        Ok(values)
    }
}
