use crate::store::{Record, MAPS, STATES, TOKENS};
use crate::value::Mapping;
use ahash::AHashSet;

/// How the export filter treats one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRule<'a> {
    /// The record's primary key must be in the set.
    KeyIn(&'a AHashSet<String>),
    /// The named string field must be in the set.
    FieldIn(&'static str, &'a AHashSet<String>),
    /// The table is left out of the snapshot.
    Excluded,
}

impl ExportRule<'_> {
    pub fn accepts(&self, record: &Record) -> bool {
        match self {
            ExportRule::KeyIn(ids) => record.key.as_str().is_some_and(|id| ids.contains(id)),
            ExportRule::FieldIn(field, ids) => record
                .field(field)
                .and_then(|v| v.as_str())
                .is_some_and(|id| ids.contains(id)),
            ExportRule::Excluded => false,
        }
    }
}

/// Selects the maps, their states, and the tokens to export.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    map_ids: AHashSet<String>,
    token_ids: AHashSet<String>,
}

impl ExportFilter {
    pub fn new<M, T>(map_ids: M, token_ids: T) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            map_ids: map_ids.into_iter().map(Into::into).collect(),
            token_ids: token_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn rule_for(&self, table: &str) -> ExportRule<'_> {
        match table {
            MAPS => ExportRule::KeyIn(&self.map_ids),
            STATES => ExportRule::FieldIn("mapId", &self.map_ids),
            TOKENS => ExportRule::KeyIn(&self.token_ids),
            _ => ExportRule::Excluded,
        }
    }

    pub fn includes_table(&self, table: &str) -> bool {
        !matches!(self.rule_for(table), ExportRule::Excluded)
    }

    pub fn accepts(&self, record: &Record) -> bool {
        self.rule_for(&record.table).accepts(record)
    }
}

/// How the import acceptance policy treats rows of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptanceRule {
    RequireFields(&'static [&'static str]),
    AcceptAll,
}

impl AcceptanceRule {
    pub fn accepts(&self, row: &Mapping) -> bool {
        match self {
            AcceptanceRule::RequireFields(fields) => fields.iter().all(|f| row.contains_key(*f)),
            AcceptanceRule::AcceptAll => true,
        }
    }
}

const OWNED_ROW_FIELDS: &[&str] = &["id", "owner"];
const STATE_ROW_FIELDS: &[&str] = &["mapId"];

/// Structural checks applied to every row before it is merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptancePolicy;

impl AcceptancePolicy {
    pub fn rule_for(&self, table: &str) -> AcceptanceRule {
        match table {
            MAPS | TOKENS => AcceptanceRule::RequireFields(OWNED_ROW_FIELDS),
            STATES => AcceptanceRule::RequireFields(STATE_ROW_FIELDS),
            _ => AcceptanceRule::AcceptAll,
        }
    }

    pub fn accepts(&self, table: &str, row: &Mapping) -> bool {
        self.rule_for(table).accepts(row)
    }
}
