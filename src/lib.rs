pub mod buffer;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod export;
pub mod filter;
pub mod format;
pub mod import;
pub mod logging;
pub mod memory;
pub mod metadata;
pub mod progress;
pub mod service;
pub mod storage;
pub mod store;
pub mod value;

pub use buffer::TransferBuffer;
pub use compression::{compress, decompress, CompressionCodec};
pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use export::{export_snapshot, ExportOptions};
pub use filter::{AcceptancePolicy, ExportFilter};
pub use format::{SnapshotHeader, FORMAT_NAME, FORMAT_VERSION};
pub use import::{import_snapshot, ImportReport, ImportStage, TableImportStats};
pub use logging::{init_logging, LoggingConfig};
pub use memory::MemoryBackend;
pub use metadata::{SnapshotMetadata, StoreIdentity, TableInfo};
pub use progress::{ChannelProgress, NoProgress, ProgressEvent, ProgressSink};
pub use service::{TransferHandle, TransferService};
pub use storage::DirectoryBackend;
pub use store::{Database, Record, RecordKey, Schema, StoreBackend, TableScan};
pub use value::{Mapping, Value};
