use crate::compression;
use crate::error::{Result, TransferError};
use crate::filter::AcceptancePolicy;
use crate::format;
use crate::metadata::{SnapshotMetadata, StoreIdentity};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::store::{Database, Record, StoreBackend};
use crate::value::Value;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::cell::RefCell;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Peek,
    IdentityCheck,
    VersionCheck,
    Stage,
    Merge,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportStage::Peek => "peek",
            ImportStage::IdentityCheck => "identity-check",
            ImportStage::VersionCheck => "version-check",
            ImportStage::Stage => "stage",
            ImportStage::Merge => "merge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableImportStats {
    pub table: String,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub database_name: String,
    pub database_version: u32,
    pub target: String,
    pub tables: Vec<TableImportStats>,
}

impl ImportReport {
    pub fn table(&self, name: &str) -> Option<&TableImportStats> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn accepted(&self) -> u64 {
        self.tables.iter().map(|t| t.accepted).sum()
    }

    pub fn rejected(&self) -> u64 {
        self.tables.iter().map(|t| t.rejected).sum()
    }
}

/// Validates `data` against the live store and merges it into a freshly
/// recreated staging database named `target`.
pub fn import_snapshot<B: StoreBackend>(
    backend: &B,
    live: &StoreIdentity,
    data: &[u8],
    target: &str,
    progress: &dyn ProgressSink,
    policy: &AcceptancePolicy,
) -> Result<ImportReport> {
    let data = compression::unpack(data)
        .map_err(|e| TransferError::UnparsableSnapshot(e.to_string()))?;

    debug!(stage = %ImportStage::Peek, bytes = data.len(), "reading snapshot header");
    let metadata = format::peek(&data)?;

    debug!(stage = %ImportStage::IdentityCheck, database = %metadata.database_name);
    if metadata.database_name != live.name {
        warn!(
            expected = %live.name,
            found = %metadata.database_name,
            "refusing snapshot from another database"
        );
        return Err(TransferError::IdentityMismatch {
            expected: live.name.clone(),
            found: metadata.database_name,
        });
    }

    debug!(stage = %ImportStage::VersionCheck, version = metadata.database_version);
    if metadata.database_version > live.schema_version {
        warn!(
            current = live.schema_version,
            requested = metadata.database_version,
            "refusing snapshot from a newer schema"
        );
        return Err(TransferError::VersionIncompatible {
            current: live.schema_version,
            requested: metadata.database_version,
        });
    }

    info!(stage = %ImportStage::Stage, staging = %target, version = metadata.database_version, "recreating staging database");
    if target == live.name {
        return Err(TransferError::InvalidTarget(format!(
            "staging database {:?} would replace the live database",
            target
        )));
    }
    backend.delete_database(target)?;
    let staging = backend.open(target, metadata.database_version)?;

    info!(stage = %ImportStage::Merge, staging = %target, "merging snapshot rows");
    let merged = merge(&staging, &data, &metadata, progress, policy);
    let closed = staging.close();
    let tables = merged?;
    closed?;

    let report = ImportReport {
        database_name: metadata.database_name,
        database_version: metadata.database_version,
        target: target.to_string(),
        tables,
    };

    info!(
        staging = %target,
        accepted = report.accepted(),
        rejected = report.rejected(),
        "snapshot imported"
    );

    Ok(report)
}

fn merge<D: Database>(
    staging: &D,
    data: &[u8],
    metadata: &SnapshotMetadata,
    progress: &dyn ProgressSink,
    policy: &AcceptancePolicy,
) -> Result<Vec<TableImportStats>> {
    let ctx = MergeContext {
        staging,
        metadata,
        progress,
        policy,
        stats: RefCell::new(Vec::new()),
        failure: RefCell::new(None),
    };

    let mut deserializer = serde_json::Deserializer::from_slice(data);
    let parsed = EnvelopeSeed { ctx: &ctx }
        .deserialize(&mut deserializer)
        .and_then(|()| deserializer.end());

    if let Err(e) = parsed {
        return Err(ctx
            .failure
            .take()
            .unwrap_or_else(|| TransferError::UnparsableSnapshot(e.to_string())));
    }

    Ok(ctx.stats.into_inner())
}

struct MergeContext<'a, D: Database> {
    staging: &'a D,
    metadata: &'a SnapshotMetadata,
    progress: &'a dyn ProgressSink,
    policy: &'a AcceptancePolicy,
    stats: RefCell<Vec<TableImportStats>>,
    failure: RefCell<Option<TransferError>>,
}

impl<D: Database> MergeContext<'_, D> {
    fn fail<E: de::Error>(&self, err: TransferError) -> E {
        let de_err = E::custom(&err);
        *self.failure.borrow_mut() = Some(err);
        de_err
    }

    fn with_stats<R>(&self, table: &str, f: impl FnOnce(&mut TableImportStats) -> R) -> R {
        let mut stats = self.stats.borrow_mut();
        let index = match stats.iter().position(|s| s.table == table) {
            Some(index) => index,
            None => {
                stats.push(TableImportStats {
                    table: table.to_string(),
                    ..Default::default()
                });
                stats.len() - 1
            }
        };
        f(&mut stats[index])
    }

    fn merge_row(&self, table: &str, row: Value) -> Result<()> {
        let record = match row {
            Value::Map(row) if self.policy.accepts(table, &row) => {
                Record::from_row(table, row, self.staging.key_path(table))
            }
            _ => None,
        };

        let Some(record) = record else {
            self.with_stats(table, |s| s.rejected += 1);
            debug!(table, "row rejected");
            return Ok(());
        };

        self.staging.put(record)?;
        let completed = self.with_stats(table, |s| {
            s.accepted += 1;
            s.accepted
        });
        self.progress
            .report(ProgressEvent::new(table, completed, self.metadata.row_count(table)));

        Ok(())
    }
}

struct EnvelopeSeed<'c, 'a, D: Database> {
    ctx: &'c MergeContext<'a, D>,
}

impl<'de, D: Database> DeserializeSeed<'de> for EnvelopeSeed<'_, '_, D> {
    type Value = ();

    fn deserialize<De: Deserializer<'de>>(self, deserializer: De) -> std::result::Result<(), De::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, D: Database> Visitor<'de> for EnvelopeSeed<'_, '_, D> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a snapshot object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "data" {
                map.next_value_seed(BodySeed { ctx: self.ctx })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct BodySeed<'c, 'a, D: Database> {
    ctx: &'c MergeContext<'a, D>,
}

impl<'de, D: Database> DeserializeSeed<'de> for BodySeed<'_, '_, D> {
    type Value = ();

    fn deserialize<De: Deserializer<'de>>(self, deserializer: De) -> std::result::Result<(), De::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, D: Database> Visitor<'de> for BodySeed<'_, '_, D> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a snapshot body")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "data" {
                map.next_value_seed(TablesSeed { ctx: self.ctx })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct TablesSeed<'c, 'a, D: Database> {
    ctx: &'c MergeContext<'a, D>,
}

impl<'de, D: Database> DeserializeSeed<'de> for TablesSeed<'_, '_, D> {
    type Value = ();

    fn deserialize<De: Deserializer<'de>>(self, deserializer: De) -> std::result::Result<(), De::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, D: Database> Visitor<'de> for TablesSeed<'_, '_, D> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of tables")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while seq.next_element_seed(TableSeed { ctx: self.ctx })?.is_some() {}
        Ok(())
    }
}

struct TableSeed<'c, 'a, D: Database> {
    ctx: &'c MergeContext<'a, D>,
}

impl<'de, D: Database> DeserializeSeed<'de> for TableSeed<'_, '_, D> {
    type Value = ();

    fn deserialize<De: Deserializer<'de>>(self, deserializer: De) -> std::result::Result<(), De::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, D: Database> Visitor<'de> for TableSeed<'_, '_, D> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a table entry")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        let mut table: Option<String> = None;
        // Rows seen before the table name are held until the name arrives.
        let mut pending: Option<Vec<Value>> = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "tableName" => {
                    let name: String = map.next_value()?;
                    self.ctx.with_stats(&name, |_| ());
                    table = Some(name);
                }
                "rows" => match table.as_deref() {
                    Some(name) => map.next_value_seed(RowsSeed {
                        ctx: self.ctx,
                        table: name,
                    })?,
                    None => pending = Some(map.next_value()?),
                },
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        let table = table.ok_or_else(|| <A::Error as de::Error>::missing_field("tableName"))?;
        for row in pending.into_iter().flatten() {
            self.ctx
                .merge_row(&table, row)
                .map_err(|e| self.ctx.fail::<A::Error>(e))?;
        }

        Ok(())
    }
}

struct RowsSeed<'c, 'a, 't, D: Database> {
    ctx: &'c MergeContext<'a, D>,
    table: &'t str,
}

impl<'de, D: Database> DeserializeSeed<'de> for RowsSeed<'_, '_, '_, D> {
    type Value = ();

    fn deserialize<De: Deserializer<'de>>(self, deserializer: De) -> std::result::Result<(), De::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, D: Database> Visitor<'de> for RowsSeed<'_, '_, '_, D> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(row) = seq.next_element::<Value>()? {
            self.ctx
                .merge_row(self.table, row)
                .map_err(|e| self.ctx.fail::<A::Error>(e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{export_snapshot, ExportOptions};
    use crate::filter::ExportFilter;
    use crate::format::{FORMAT_NAME, FORMAT_VERSION};
    use crate::memory::{MemoryBackend, MemoryDatabase};
    use crate::progress::NoProgress;
    use crate::store::{TableScan, MAPS, STATES, TOKENS};
    use crate::value::mapping;
    use serde_json::json;

    const LIVE: &str = "main";
    const STAGING: &str = "main-import";

    fn source_db() -> MemoryDatabase {
        let backend = MemoryBackend::default();
        let db = backend.open(LIVE, 5).unwrap();
        for id in ["map1", "map2"] {
            let row = mapping([("id", id), ("owner", "player")]);
            db.put(Record::from_row(MAPS, row, "id").unwrap()).unwrap();
            let state = mapping([("mapId", id), ("fog", "[]")]);
            db.put(Record::from_row(STATES, state, "mapId").unwrap()).unwrap();
        }
        db
    }

    fn export_map1() -> Vec<u8> {
        let filter = ExportFilter::new(["map1"], Vec::<String>::new());
        export_snapshot(&source_db(), &filter, &NoProgress, &ExportOptions::default())
            .unwrap()
            .into_vec()
    }

    fn snapshot(name: &str, version: u32, tables: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "formatName": FORMAT_NAME,
            "formatVersion": FORMAT_VERSION,
            "data": {
                "databaseName": name,
                "databaseVersion": version,
                "tables": [],
                "data": tables,
            }
        }))
        .unwrap()
    }

    fn keys(backend: &MemoryBackend, name: &str, version: u32, table: &str) -> Vec<String> {
        let db = backend.open(name, version).unwrap();
        let scan = TableScan::new(&db, table);
        scan.rows()
            .unwrap()
            .map(|r| r.unwrap().key.to_string())
            .collect()
    }

    fn live() -> StoreIdentity {
        StoreIdentity::new(LIVE, 5)
    }

    #[test]
    fn test_export_import_fidelity() {
        let backend = MemoryBackend::default();
        let data = export_map1();

        let report = import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();
        assert_eq!(report.database_name, LIVE);
        assert_eq!(report.table(MAPS).unwrap().accepted, 1);
        assert_eq!(report.rejected(), 0);

        assert_eq!(keys(&backend, STAGING, 5, MAPS), vec!["map1"]);
        assert_eq!(keys(&backend, STAGING, 5, STATES), vec!["map1"]);
        assert!(keys(&backend, STAGING, 5, TOKENS).is_empty());
    }

    #[test]
    fn test_tag_shaped_values_survive_export_import() {
        let source = MemoryBackend::default();
        let db = source.open(LIVE, 5).unwrap();
        let mut row = mapping([("id", "map1"), ("owner", "player")]);
        row.insert("meta".to_string(), Value::Map(mapping([("$binary", "AQID")])));
        row.insert("notes".to_string(), Value::Map(mapping([("$binary", "not base64!")])));
        row.insert("scale".to_string(), Value::Float(f64::NAN));
        row.insert("reach".to_string(), Value::Float(f64::INFINITY));
        db.put(Record::from_row(MAPS, row.clone(), "id").unwrap()).unwrap();

        let filter = ExportFilter::new(["map1"], Vec::<String>::new());
        let data = export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap();

        let backend = MemoryBackend::default();
        import_snapshot(&backend, &live(), data.as_slice(), STAGING, &NoProgress, &AcceptancePolicy).unwrap();

        let staging = backend.open(STAGING, 5).unwrap();
        let record = staging.get(MAPS, &"map1".into()).unwrap().unwrap();
        assert_eq!(record.field("meta"), row.get("meta"));
        assert_eq!(record.field("notes"), row.get("notes"));
        assert_eq!(record.field("reach"), Some(&Value::Float(f64::INFINITY)));
        assert!(matches!(record.field("scale"), Some(Value::Float(n)) if n.is_nan()));
    }

    #[test]
    fn test_identity_mismatch() {
        let backend = MemoryBackend::default();
        let data = snapshot("other", 5, json!([]));

        let err = import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap_err();
        assert!(matches!(err, TransferError::IdentityMismatch { ref found, .. } if found == "other"));
        assert!(err.is_rejection());
        assert!(!backend.exists(STAGING));
    }

    #[test]
    fn test_version_incompatible() {
        let backend = MemoryBackend::default();
        let data = snapshot(LIVE, 7, json!([]));

        let err = import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap_err();
        assert!(matches!(err, TransferError::VersionIncompatible { current: 5, requested: 7 }));
        assert!(!backend.exists(STAGING));
    }

    #[test]
    fn test_older_snapshot_stages_at_its_own_version() {
        let backend = MemoryBackend::default();
        let data = snapshot(LIVE, 3, json!([{ "tableName": MAPS, "rows": [{ "id": "m", "owner": "p" }] }]));

        import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();

        assert!(backend.open(STAGING, 2).is_err());
        assert_eq!(keys(&backend, STAGING, 3, MAPS), vec!["m"]);
    }

    #[test]
    fn test_acceptance_filtering() {
        let backend = MemoryBackend::default();
        let data = snapshot(LIVE, 5, json!([
            { "tableName": MAPS, "rows": [
                { "id": "good", "owner": "p" },
                { "id": "orphan" },
                "not a row",
            ]},
            { "tableName": STATES, "rows": [{ "mapId": "good" }, { "id": "nomap" }] },
            { "tableName": "notes", "rows": [{ "id": "n1" }, { "text": "unkeyed" }] },
        ]));

        let report = import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();

        assert_eq!(keys(&backend, STAGING, 5, MAPS), vec!["good"]);
        assert_eq!(keys(&backend, STAGING, 5, STATES), vec!["good"]);
        assert_eq!(keys(&backend, STAGING, 5, "notes"), vec!["n1"]);
        assert_eq!(
            report.table(MAPS),
            Some(&TableImportStats { table: MAPS.to_string(), accepted: 1, rejected: 2 })
        );
        assert_eq!(report.rejected(), 4);
    }

    #[test]
    fn test_reimport_is_idempotent_and_clears_staging() {
        let backend = MemoryBackend::default();
        {
            let stale = backend.open(STAGING, 9).unwrap();
            stale
                .put(Record::from_row(MAPS, mapping([("id", "stale"), ("owner", "p")]), "id").unwrap())
                .unwrap();
        }

        let data = export_map1();
        import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();
        let once = keys(&backend, STAGING, 5, MAPS);
        import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();
        let twice = keys(&backend, STAGING, 5, MAPS);

        assert_eq!(once, vec!["map1"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_duplicate_keys_overwrite() {
        let backend = MemoryBackend::default();
        let data = snapshot(LIVE, 5, json!([{ "tableName": MAPS, "rows": [
            { "id": "m", "owner": "p", "name": "first" },
            { "id": "m", "owner": "p", "name": "second" },
        ]}]));

        import_snapshot(&backend, &live(), &data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();

        let staging = backend.open(STAGING, 5).unwrap();
        let record = staging.get(MAPS, &"m".into()).unwrap().unwrap();
        assert_eq!(record.field("name"), Some(&Value::from("second")));
        assert_eq!(staging.count(MAPS).unwrap(), 1);
    }

    #[test]
    fn test_rows_before_table_name() {
        let backend = MemoryBackend::default();
        let data = br#"{"formatName":"vtt-transfer","formatVersion":1,"data":{
            "databaseName":"main","databaseVersion":5,
            "data":[{"rows":[{"id":"m","owner":"p"}],"tableName":"maps"}]}}"#;

        import_snapshot(&backend, &live(), data, STAGING, &NoProgress, &AcceptancePolicy).unwrap();
        assert_eq!(keys(&backend, STAGING, 5, MAPS), vec!["m"]);
    }

    #[test]
    fn test_malformed_body() {
        let backend = MemoryBackend::default();
        let data = br#"{"formatName":"vtt-transfer","formatVersion":1,"data":{
            "databaseName":"main","databaseVersion":5,
            "data":[{"rows":[{"id":"m","owner":"p"}]}]}}"#;

        let err = import_snapshot(&backend, &live(), data, STAGING, &NoProgress, &AcceptancePolicy).unwrap_err();
        assert!(matches!(err, TransferError::UnparsableSnapshot(_)));

        let err = import_snapshot(&backend, &live(), b"{\"formatName\":", STAGING, &NoProgress, &AcceptancePolicy)
            .unwrap_err();
        assert!(matches!(err, TransferError::UnparsableSnapshot(_)));
    }

    #[test]
    fn test_live_name_is_not_a_target() {
        let backend = MemoryBackend::default();
        let live_db = backend.open(LIVE, 5).unwrap();
        live_db
            .put(Record::from_row(MAPS, mapping([("id", "keep"), ("owner", "p")]), "id").unwrap())
            .unwrap();

        let err = import_snapshot(&backend, &live(), &export_map1(), LIVE, &NoProgress, &AcceptancePolicy)
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidTarget(_)));
        assert_eq!(keys(&backend, LIVE, 5, MAPS), vec!["keep"]);
    }

    #[test]
    fn test_import_progress() {
        let backend = MemoryBackend::default();
        let events = parking_lot::Mutex::new(Vec::new());
        let sink = |e: ProgressEvent| events.lock().push(e);

        import_snapshot(&backend, &live(), &export_map1(), STAGING, &sink, &AcceptancePolicy).unwrap();

        let events = events.into_inner();
        assert_eq!(
            events,
            vec![
                ProgressEvent::new(MAPS, 1, Some(1)),
                ProgressEvent::new(STATES, 1, Some(1)),
            ]
        );
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_snapshot() {
        use crate::compression::CompressionCodec;

        let backend = MemoryBackend::default();
        let filter = ExportFilter::new(["map1", "map2"], Vec::<String>::new());
        let options = ExportOptions::default().with_compression(CompressionCodec::Lz4);
        let data = export_snapshot(&source_db(), &filter, &NoProgress, &options).unwrap();

        import_snapshot(&backend, &live(), data.as_slice(), STAGING, &NoProgress, &AcceptancePolicy).unwrap();
        assert_eq!(keys(&backend, STAGING, 5, MAPS), vec!["map1", "map2"]);
    }
}
