use crate::error::{Result, TransferError};
use crate::metadata::SnapshotMetadata;
use serde::{Deserialize, Serialize};

pub const FORMAT_NAME: &str = "vtt-transfer";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHeader {
    pub format_name: String,
    pub format_version: u32,
}

impl SnapshotHeader {
    pub fn new() -> Self {
        Self {
            format_name: FORMAT_NAME.to_string(),
            format_version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_name != FORMAT_NAME {
            return Err(TransferError::UnparsableSnapshot(format!(
                "unknown format {:?}",
                self.format_name
            )));
        }

        if self.format_version > FORMAT_VERSION {
            return Err(TransferError::UnparsableSnapshot(format!(
                "format version {} is newer than supported version {}",
                self.format_version, FORMAT_VERSION
            )));
        }

        Ok(())
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level object written by the exporter. `B` is the body carrying both
/// metadata and the streamed rows.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope<B> {
    #[serde(flatten)]
    pub header: SnapshotHeader,
    pub data: B,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeekEnvelope {
    format_name: Option<String>,
    format_version: Option<u32>,
    // Row arrays inside `data` are not fields of SnapshotMetadata and are
    // skipped by the parser without being built.
    data: Option<SnapshotMetadata>,
}

/// Reads the snapshot header without materializing any rows.
pub fn peek(bytes: &[u8]) -> Result<SnapshotMetadata> {
    let envelope: PeekEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| TransferError::UnparsableSnapshot(e.to_string()))?;

    let header = SnapshotHeader {
        format_name: envelope
            .format_name
            .ok_or_else(|| TransferError::UnparsableSnapshot("missing formatName".to_string()))?,
        format_version: envelope
            .format_version
            .ok_or_else(|| TransferError::UnparsableSnapshot("missing formatVersion".to_string()))?,
    };
    header.validate()?;

    envelope
        .data
        .ok_or_else(|| TransferError::UnparsableSnapshot("missing database metadata".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_skips_rows() {
        let json = r#"{
            "formatName": "vtt-transfer",
            "formatVersion": 1,
            "data": {
                "databaseName": "main",
                "databaseVersion": 3,
                "tables": [{ "name": "maps", "schema": "id", "rowCount": 2 }],
                "data": [{ "tableName": "maps", "rows": [{ "id": "a" }, { "id": "b" }] }]
            }
        }"#;

        let meta = peek(json.as_bytes()).unwrap();
        assert_eq!(meta.database_name, "main");
        assert_eq!(meta.database_version, 3);
        assert_eq!(meta.exported_at, None);
        assert_eq!(meta.row_count("maps"), Some(2));
    }

    #[test]
    fn test_peek_missing_metadata() {
        let json = r#"{ "formatName": "vtt-transfer", "formatVersion": 1 }"#;
        assert!(matches!(peek(json.as_bytes()), Err(TransferError::UnparsableSnapshot(_))));

        let json = r#"{ "formatName": "vtt-transfer", "formatVersion": 1, "data": { "databaseVersion": 1 } }"#;
        assert!(matches!(peek(json.as_bytes()), Err(TransferError::UnparsableSnapshot(_))));
    }

    #[test]
    fn test_peek_rejects_foreign_and_future_formats() {
        let foreign = r#"{ "formatName": "other", "formatVersion": 1,
            "data": { "databaseName": "main", "databaseVersion": 1 } }"#;
        assert!(matches!(peek(foreign.as_bytes()), Err(TransferError::UnparsableSnapshot(_))));

        let future = r#"{ "formatName": "vtt-transfer", "formatVersion": 99,
            "data": { "databaseName": "main", "databaseVersion": 1 } }"#;
        assert!(matches!(peek(future.as_bytes()), Err(TransferError::UnparsableSnapshot(_))));
    }

    #[test]
    fn test_peek_garbage() {
        assert!(matches!(peek(b"\x00\x01 not json"), Err(TransferError::UnparsableSnapshot(_))));
    }
}
