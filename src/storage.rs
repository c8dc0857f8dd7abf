use crate::error::{Result, TransferError};
use crate::metadata::StoreIdentity;
use crate::store::{Database, Record, RecordKey, Rows, Schema, StoreBackend, TableName};
use crate::value::Mapping;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const META_FILE: &str = "meta.json";
const TABLES_DIR: &str = "tables";
const RECORD_EXTENSION: &str = "msgpack";

/// Stores each database as `<root>/<name>/meta.json` plus one file per record
/// under `<root>/<name>/tables/<table>/`.
pub struct DirectoryBackend {
    root_dir: PathBuf,
    schema: Arc<Schema>,
}

impl DirectoryBackend {
    pub fn new<P: AsRef<Path>>(root_dir: P, schema: Schema) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_dir)?;

        Ok(Self {
            root_dir,
            schema: Arc::new(schema),
        })
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut databases = Vec::new();

        for entry in std::fs::read_dir(&self.root_dir)? {
            let path = entry?.path();

            if path.join(META_FILE).exists() {
                if let Some(name) = path.file_name() {
                    databases.push(name.to_string_lossy().to_string());
                }
            }
        }

        databases.sort();
        Ok(databases)
    }

    fn database_dir(&self, name: &str) -> Result<PathBuf> {
        validate_component("database", name)?;
        Ok(self.root_dir.join(name))
    }
}

impl StoreBackend for DirectoryBackend {
    type Database = DirectoryDatabase;

    fn open(&self, name: &str, version: u32) -> Result<DirectoryDatabase> {
        let dir = self.database_dir(name)?;
        std::fs::create_dir_all(dir.join(TABLES_DIR))?;

        let meta_path = dir.join(META_FILE);
        if meta_path.exists() {
            let meta_json = std::fs::read_to_string(&meta_path)?;
            let existing: StoreIdentity = serde_json::from_str(&meta_json)
                .map_err(|e| TransferError::StoreIo(format!("corrupt {}: {}", meta_path.display(), e)))?;

            if existing.schema_version > version {
                return Err(TransferError::StoreIo(format!(
                    "cannot open {} at version {}: already at version {}",
                    name, version, existing.schema_version
                )));
            }
        }

        let identity = StoreIdentity::new(name, version);
        let meta_json = serde_json::to_string_pretty(&identity)
            .map_err(|e| TransferError::EncodeFailure(e.to_string()))?;
        write_atomic(&meta_path, meta_json.as_bytes())?;

        Ok(DirectoryDatabase {
            tables_dir: dir.join(TABLES_DIR),
            identity,
            schema: self.schema.clone(),
            write_lock: Mutex::new(()),
        })
    }

    fn delete_database(&self, name: &str) -> Result<()> {
        let dir = self.database_dir(name)?;

        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }

        Ok(())
    }
}

pub struct DirectoryDatabase {
    tables_dir: PathBuf,
    identity: StoreIdentity,
    schema: Arc<Schema>,
    write_lock: Mutex<()>,
}

impl DirectoryDatabase {
    fn table_dir(&self, table: &str) -> Result<PathBuf> {
        validate_component("table", table)?;
        Ok(self.tables_dir.join(table))
    }

    fn record_path(&self, table: &str, key: &RecordKey) -> Result<PathBuf> {
        Ok(self
            .table_dir(table)?
            .join(format!("{}.{}", encode_key(key), RECORD_EXTENSION)))
    }

    fn read_record(&self, path: &Path) -> Result<Option<Mapping>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TransferError::StoreIo(format!("corrupt {}: {}", path.display(), e)))
    }

    /// Keys present in `table`, in key order. Only file names are read.
    fn keys(&self, table: &str) -> Result<Vec<RecordKey>> {
        let dir = self.table_dir(table)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != RECORD_EXTENSION) {
                continue;
            }

            let stem = path.file_stem().map(|s| s.to_string_lossy().to_string());
            match stem.as_deref().and_then(decode_key) {
                Some(key) => keys.push(key),
                None => {
                    return Err(TransferError::StoreIo(format!(
                        "unrecognized record file {}",
                        path.display()
                    )))
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

impl Database for DirectoryDatabase {
    fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    fn key_path(&self, table: &str) -> &str {
        self.schema.key_path(table)
    }

    fn table_names(&self) -> Result<Vec<TableName>> {
        let mut tables = Vec::new();

        for entry in std::fs::read_dir(&self.tables_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                tables.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        tables.sort();
        Ok(tables)
    }

    fn count(&self, table: &str) -> Result<u64> {
        Ok(self.keys(table)?.len() as u64)
    }

    fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        let path = self.record_path(table, key)?;
        Ok(self.read_record(&path)?.map(|value| Record {
            table: table.to_string(),
            key: key.clone(),
            value,
        }))
    }

    fn put(&self, record: Record) -> Result<()> {
        let _guard = self.write_lock.lock();

        std::fs::create_dir_all(self.table_dir(&record.table)?)?;
        let path = self.record_path(&record.table, &record.key)?;
        let bytes = rmp_serde::to_vec(&record.value)?;
        write_atomic(&path, &bytes)
    }

    fn scan(&self, table: &str) -> Result<Rows<'_>> {
        let table_name = table.to_string();
        let keys = self.keys(table)?;

        // Each step reads one record file.
        Ok(Box::new(keys.into_iter().filter_map(move |key| {
            match self.get(&table_name, &key) {
                Ok(Some(record)) => Some(Ok(record)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }
}

// Integer keys become `i<n>`, string keys `s<hex bytes>`, so any key maps to a
// safe file name and integer and string keys never share a file.
fn encode_key(key: &RecordKey) -> String {
    match key {
        RecordKey::Integer(n) => format!("i{}", n),
        RecordKey::String(s) => format!("s{}", hex::encode(s)),
    }
}

fn decode_key(name: &str) -> Option<RecordKey> {
    if let Some(n) = name.strip_prefix('i') {
        return n.parse().ok().map(RecordKey::Integer);
    }

    let bytes = hex::decode(name.strip_prefix('s')?).ok()?;
    String::from_utf8(bytes).ok().map(RecordKey::String)
}

fn validate_component(kind: &str, name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(TransferError::StoreIo(format!("invalid {} name {:?}", kind, name)));
    }

    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(tmp_path, path)?;
    Ok(())
}
