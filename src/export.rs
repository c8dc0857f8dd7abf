use crate::buffer::TransferBuffer;
use crate::compression::{compress, CompressionCodec};
use crate::error::{Result, TransferError};
use crate::filter::ExportFilter;
use crate::format::{SnapshotEnvelope, SnapshotHeader};
use crate::metadata::{SnapshotMetadata, TableInfo};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::store::{Database, TableScan};
use crate::value::MapRef;
use serde::ser::{self, Serialize, SerializeSeq, SerializeStruct, Serializer};
use serde::Deserialize;
use std::cell::RefCell;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub compression: CompressionCodec,
    pub pretty: bool,
}

impl ExportOptions {
    pub fn with_compression(mut self, codec: CompressionCodec) -> Self {
        self.compression = codec;
        self
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            compression: CompressionCodec::None,
            pretty: true,
        }
    }
}

/// Counts, then streams the filtered rows of every table into a snapshot.
pub fn export_snapshot<D: Database + ?Sized>(
    db: &D,
    filter: &ExportFilter,
    progress: &dyn ProgressSink,
    options: &ExportOptions,
) -> Result<TransferBuffer> {
    let identity = db.identity();
    info!(
        database = %identity.name,
        version = identity.schema_version,
        "exporting snapshot"
    );

    let mut metadata = SnapshotMetadata::new(identity);
    for table in db.table_names()? {
        if !filter.includes_table(&table) {
            debug!(table = %table, "table excluded from export");
            continue;
        }

        let row_count = TableScan::new(db, &table).count_matching(|r| filter.accepts(r))?;
        debug!(table = %table, rows = row_count, "table selected for export");

        let info = TableInfo::new(table.as_str(), db.key_path(&table)).with_row_count(row_count);
        metadata = metadata.with_table(info);
    }

    let ctx = StreamContext {
        filter,
        progress,
        failure: RefCell::new(None),
    };

    let streams = metadata
        .tables
        .iter()
        .map(|info| TableStream {
            info,
            scan: TableScan::new(db, &info.name),
            ctx: &ctx,
        })
        .collect();

    let envelope = SnapshotEnvelope {
        header: SnapshotHeader::new(),
        data: ExportBody {
            metadata: &metadata,
            streams,
        },
    };

    let mut out = Vec::new();
    let written = if options.pretty {
        serde_json::to_writer_pretty(&mut out, &envelope)
    } else {
        serde_json::to_writer(&mut out, &envelope)
    };

    if let Err(e) = written {
        return Err(ctx
            .failure
            .take()
            .unwrap_or_else(|| TransferError::EncodeFailure(e.to_string())));
    }

    let packed = match options.compression {
        CompressionCodec::None => out,
        codec => compress(&out, codec)?,
    };

    info!(
        database = %identity.name,
        tables = metadata.tables.len(),
        bytes = packed.len(),
        "snapshot exported"
    );

    Ok(TransferBuffer::new(packed))
}

struct StreamContext<'a> {
    filter: &'a ExportFilter,
    progress: &'a dyn ProgressSink,
    failure: RefCell<Option<TransferError>>,
}

impl StreamContext<'_> {
    /// Parks a store error so it can be returned with its kind intact once
    /// the serializer unwinds.
    fn fail<E: ser::Error>(&self, err: TransferError) -> E {
        let ser_err = E::custom(&err);
        *self.failure.borrow_mut() = Some(err);
        ser_err
    }
}

struct ExportBody<'a, D: Database + ?Sized> {
    metadata: &'a SnapshotMetadata,
    streams: Vec<TableStream<'a, D>>,
}

impl<D: Database + ?Sized> Serialize for ExportBody<'_, D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_struct("ExportBody", 5)?;
        body.serialize_field("databaseName", &self.metadata.database_name)?;
        body.serialize_field("databaseVersion", &self.metadata.database_version)?;
        body.serialize_field("exportedAt", &self.metadata.exported_at)?;
        body.serialize_field("tables", &self.metadata.tables)?;
        body.serialize_field("data", &self.streams)?;
        body.end()
    }
}

struct TableStream<'a, D: Database + ?Sized> {
    info: &'a TableInfo,
    scan: TableScan<'a, D>,
    ctx: &'a StreamContext<'a>,
}

impl<D: Database + ?Sized> Serialize for TableStream<'_, D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut entry = serializer.serialize_struct("TableData", 2)?;
        entry.serialize_field("tableName", &self.info.name)?;
        entry.serialize_field("rows", &RowStream(self))?;
        entry.end()
    }
}

struct RowStream<'s, 'a, D: Database + ?Sized>(&'s TableStream<'a, D>);

impl<D: Database + ?Sized> Serialize for RowStream<'_, '_, D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let stream = self.0;
        let ctx = stream.ctx;
        let total = stream.info.row_count;

        let rows = stream.scan.rows().map_err(|e| ctx.fail::<S::Error>(e))?;
        let mut seq = serializer.serialize_seq(None)?;
        let mut completed = 0;

        for row in rows {
            let record = row.map_err(|e| ctx.fail::<S::Error>(e))?;
            if !ctx.filter.accepts(&record) {
                continue;
            }

            seq.serialize_element(&MapRef(&record.value))?;
            completed += 1;
            ctx.progress
                .report(ProgressEvent::new(&record.table, completed, total));
        }

        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::memory::{MemoryBackend, MemoryDatabase};
    use crate::metadata::StoreIdentity;
    use crate::progress::NoProgress;
    use crate::store::{Record, RecordKey, Rows, StoreBackend, TableName, MAPS, STATES, TOKENS};
    use crate::value::{mapping, Value};
    use serde_json::Value as Json;

    fn seeded_db() -> MemoryDatabase {
        let backend = MemoryBackend::default();
        let db = backend.open("main", 5).unwrap();

        for id in ["map2", "map1"] {
            let row = mapping([("id", id), ("owner", "player"), ("name", id)]);
            db.put(Record::from_row(MAPS, row, "id").unwrap()).unwrap();
            let state = mapping([("mapId", id), ("drawings", "{}")]);
            db.put(Record::from_row(STATES, state, "mapId").unwrap()).unwrap();
        }
        for id in ["t1", "t2"] {
            let row = mapping([("id", Value::from(id)), ("owner", Value::from("player")), ("file", Value::Binary(vec![1, 2]))]);
            db.put(Record::from_row(TOKENS, row, "id").unwrap()).unwrap();
        }
        db.put(Record::from_row("notes", mapping([("id", "n1")]), "id").unwrap())
            .unwrap();

        db
    }

    fn parse(buffer: TransferBuffer) -> Json {
        serde_json::from_slice(buffer.as_slice()).unwrap()
    }

    fn rows_of<'a>(snapshot: &'a Json, table: &str) -> Vec<&'a Json> {
        snapshot["data"]["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["tableName"] == table)
            .map(|t| t["rows"].as_array().unwrap().iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_export_applies_filter() {
        let db = seeded_db();
        let filter = ExportFilter::new(["map1"], Vec::<String>::new());

        let buffer = export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap();
        let text = String::from_utf8(buffer.as_slice().to_vec()).unwrap();
        assert!(text.contains("\n  \"formatName\""));

        let snapshot = parse(buffer);
        assert_eq!(snapshot["formatName"], "vtt-transfer");
        assert_eq!(snapshot["data"]["databaseName"], "main");
        assert_eq!(snapshot["data"]["databaseVersion"], 5);

        let maps = rows_of(&snapshot, MAPS);
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0]["id"], "map1");

        let states = rows_of(&snapshot, STATES);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0]["mapId"], "map1");

        assert!(rows_of(&snapshot, TOKENS).is_empty());
        assert!(rows_of(&snapshot, "notes").is_empty());

        let tables: Vec<&str> = snapshot["data"]["tables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(tables, vec![MAPS, STATES, TOKENS]);
        assert_eq!(snapshot["data"]["tables"][0]["rowCount"], 1);
        assert_eq!(snapshot["data"]["tables"][2]["rowCount"], 0);
    }

    #[test]
    fn test_export_binary_is_tagged() {
        let db = seeded_db();
        let filter = ExportFilter::new(Vec::<String>::new(), ["t2"]);

        let snapshot = parse(export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap());
        let tokens = rows_of(&snapshot, TOKENS);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0]["file"]["$binary"], "AQI=");
    }

    #[test]
    fn test_export_progress_is_monotonic() {
        let db = seeded_db();
        let filter = ExportFilter::new(["map1", "map2"], ["t1"]);
        let events = parking_lot::Mutex::new(Vec::new());
        let sink = |e: ProgressEvent| events.lock().push(e);

        export_snapshot(&db, &filter, &sink, &ExportOptions::default()).unwrap();

        let events = events.into_inner();
        let maps: Vec<u64> = events.iter().filter(|e| e.table == MAPS).map(|e| e.completed).collect();
        assert_eq!(maps, vec![1, 2]);
        assert!(events.iter().all(|e| e.total.is_some()));
        assert!(events.iter().filter(|e| e.table == TOKENS).last().unwrap().is_complete());
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_export_is_deterministic() {
        let db = seeded_db();
        let filter = ExportFilter::new(["map1", "map2"], ["t1", "t2"]);

        let first = parse(export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap());
        let second = parse(export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap());
        assert_eq!(first["data"]["data"], second["data"]["data"]);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_export() {
        use crate::compression::{decompress, detect, CompressionType};

        let db = seeded_db();
        let filter = ExportFilter::new(["map1"], ["t1"]);
        let options = ExportOptions::default().with_compression(CompressionCodec::zstd_default());

        let buffer = export_snapshot(&db, &filter, &NoProgress, &options).unwrap();
        assert_eq!(detect(buffer.as_slice()), CompressionType::Zstd);

        let plain = decompress(buffer.as_slice(), CompressionType::Zstd).unwrap();
        let snapshot: Json = serde_json::from_slice(&plain).unwrap();
        assert_eq!(rows_of(&snapshot, MAPS).len(), 1);
    }

    /// Fails after yielding the first row of every table.
    struct FlakyDatabase(MemoryDatabase);

    impl Database for FlakyDatabase {
        fn identity(&self) -> &StoreIdentity {
            self.0.identity()
        }

        fn key_path(&self, table: &str) -> &str {
            self.0.key_path(table)
        }

        fn table_names(&self) -> Result<Vec<TableName>> {
            self.0.table_names()
        }

        fn count(&self, table: &str) -> Result<u64> {
            self.0.count(table)
        }

        fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
            self.0.get(table, key)
        }

        fn put(&self, record: Record) -> Result<()> {
            self.0.put(record)
        }

        fn scan(&self, table: &str) -> Result<Rows<'_>> {
            let rows = self.0.scan(table)?.take(1).chain(std::iter::once(Err(
                TransferError::StoreIo("cursor lost".to_string()),
            )));
            Ok(Box::new(rows))
        }
    }

    #[test]
    fn test_store_failure_keeps_kind() {
        let db = FlakyDatabase(seeded_db());
        let filter = ExportFilter::new(["map1"], Vec::<String>::new());

        let err = export_snapshot(&db, &filter, &NoProgress, &ExportOptions::default()).unwrap_err();
        assert!(matches!(err, TransferError::StoreIo(msg) if msg == "cursor lost"));
    }
}
