use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreIdentity {
    pub name: String,
    pub schema_version: u32,
}

impl StoreIdentity {
    pub fn new(name: impl Into<String>, schema_version: u32) -> Self {
        Self {
            name: name.into(),
            schema_version,
        }
    }
}

/// Per-table entry of a snapshot header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    /// Key path of the table's primary key.
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            row_count: None,
        }
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }
}

/// Snapshot header, readable without touching row data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub database_name: String,
    pub database_version: u32,
    #[serde(default)]
    pub exported_at: Option<i64>,
    #[serde(default)]
    pub tables: Vec<TableInfo>,
}

impl SnapshotMetadata {
    pub fn new(identity: &StoreIdentity) -> Self {
        Self {
            database_name: identity.name.clone(),
            database_version: identity.schema_version,
            exported_at: Some(chrono::Utc::now().timestamp()),
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: TableInfo) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn row_count(&self, name: &str) -> Option<u64> {
        self.table(name).and_then(|t| t.row_count)
    }
}
