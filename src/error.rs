use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Unable to parse snapshot: {0}")]
    UnparsableSnapshot(String),

    #[error("Snapshot belongs to database {found:?}, expected {expected:?}")]
    IdentityMismatch { expected: String, found: String },

    #[error("Database version differs: current database is at version {current} but snapshot is {requested}")]
    VersionIncompatible { current: u32, requested: u32 },

    #[error("Store I/O failure: {0}")]
    StoreIo(String),

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Encode failure: {0}")]
    EncodeFailure(String),

    #[error("No record with key {key:?} in table {table:?}")]
    NotFound { table: String, key: String },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid import target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer service is closed")]
    ServiceClosed,

    #[error("Transfer worker failed: {0}")]
    Worker(String),
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::StoreIo(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TransferError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TransferError::EncodeFailure(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransferError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TransferError::DecodeFailure(err.to_string())
    }
}

impl TransferError {
    /// Errors raised before the store was touched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TransferError::UnparsableSnapshot(_)
                | TransferError::IdentityMismatch { .. }
                | TransferError::VersionIncompatible { .. }
                | TransferError::InvalidTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
