use crate::buffer::TransferBuffer;
use crate::codec;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::export::{export_snapshot, ExportOptions};
use crate::filter::{AcceptancePolicy, ExportFilter};
use crate::import::{import_snapshot, ImportReport};
use crate::metadata::StoreIdentity;
use crate::progress::ProgressSink;
use crate::store::{Database, Record, RecordKey, StoreBackend, TableScan};
use crate::value::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    Load {
        table: String,
        key: Option<String>,
        reply: Reply<TransferBuffer>,
    },
    Put {
        buffer: TransferBuffer,
        table: String,
        reply: Reply<usize>,
    },
    Export {
        filter: ExportFilter,
        progress: Arc<dyn ProgressSink>,
        reply: Reply<TransferBuffer>,
    },
    Import {
        buffer: TransferBuffer,
        target: String,
        progress: Arc<dyn ProgressSink>,
        reply: Reply<ImportReport>,
    },
    Shutdown,
}

pub struct TransferService<B: StoreBackend> {
    backend: Arc<B>,
    live: Arc<B::Database>,
    export: ExportOptions,
    policy: AcceptancePolicy,
    live_lock: Arc<RwLock<()>>,
    staging_lock: Arc<Mutex<()>>,
}

impl<B: StoreBackend> Clone for TransferService<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            live: self.live.clone(),
            export: self.export,
            policy: self.policy,
            live_lock: self.live_lock.clone(),
            staging_lock: self.staging_lock.clone(),
        }
    }
}

impl<B: StoreBackend> TransferService<B> {
    /// Opens the live database and starts the service on the current tokio
    /// runtime.
    pub fn spawn(backend: Arc<B>, config: TransferConfig) -> Result<TransferHandle> {
        config.validate()?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransferError::Worker(format!("no tokio runtime: {}", e)))?;

        let live = backend.open(&config.database_name, config.schema_version)?;
        let identity = live.identity().clone();

        let service = Self {
            backend,
            live: Arc::new(live),
            export: config.export,
            policy: AcceptancePolicy,
            live_lock: Arc::new(RwLock::new(())),
            staging_lock: Arc::new(Mutex::new(())),
        };

        let (sender, requests) = mpsc::channel(config.channel_capacity);
        runtime.spawn(service.run(requests));

        info!(
            database = %identity.name,
            version = identity.schema_version,
            "transfer service started"
        );

        Ok(TransferHandle {
            sender,
            identity: Arc::new(identity),
        })
    }

    async fn run(self, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.recv().await {
            if matches!(request, Request::Shutdown) {
                break;
            }

            let service = self.clone();
            tokio::spawn(async move { service.handle(request).await });
        }

        info!(database = %self.live.identity().name, "transfer service stopped");
    }

    async fn handle(&self, request: Request) {
        match request {
            Request::Load { table, key, reply } => {
                let _guard = self.live_lock.read().await;
                let live = self.live.clone();
                let result = run_blocking(move || load(&*live, &table, key.as_deref())).await;
                let _ = reply.send(result);
            }
            Request::Put { buffer, table, reply } => {
                let _guard = self.live_lock.write().await;
                let live = self.live.clone();
                let result = run_blocking(move || put(&*live, &table, buffer)).await;
                let _ = reply.send(result);
            }
            Request::Export {
                filter,
                progress,
                reply,
            } => {
                let _guard = self.live_lock.read().await;
                let live = self.live.clone();
                let options = self.export;
                let result = run_blocking(move || {
                    export_snapshot(&*live, &filter, progress.as_ref(), &options)
                })
                .await;
                let _ = reply.send(result);
            }
            Request::Import {
                buffer,
                target,
                progress,
                reply,
            } => {
                let _guard = self.staging_lock.lock().await;
                let backend = self.backend.clone();
                let live = self.live.identity().clone();
                let policy = self.policy;
                let result = run_blocking(move || {
                    import_snapshot(
                        &*backend,
                        &live,
                        buffer.as_slice(),
                        &target,
                        progress.as_ref(),
                        &policy,
                    )
                })
                .await;
                let _ = reply.send(result);
            }
            Request::Shutdown => {}
        }
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| TransferError::Worker(e.to_string()))?
}

fn load<D: Database + ?Sized>(db: &D, table: &str, key: Option<&str>) -> Result<TransferBuffer> {
    // An empty key selects the whole table.
    match key.filter(|key| !key.is_empty()) {
        Some(key) => {
            let record = db
                .get(table, &RecordKey::from(key))?
                .ok_or_else(|| TransferError::NotFound {
                    table: table.to_string(),
                    key: key.to_string(),
                })?;
            Ok(TransferBuffer::new(codec::encode(&Value::Map(record.value))?))
        }
        None => {
            // Cursor iteration keeps each store read to one row.
            let rows = TableScan::new(db, table).collect_values()?;
            debug!(table, rows = rows.len(), "loaded table");
            Ok(TransferBuffer::new(codec::encode_rows(&rows)?))
        }
    }
}

fn put<D: Database + ?Sized>(db: &D, table: &str, buffer: TransferBuffer) -> Result<usize> {
    let rows = codec::decode_rows(buffer.as_slice())?;
    let key_path = db.key_path(table);

    // Every row is keyed before the first write so a bad buffer changes nothing.
    let records = rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            Record::from_row(table, row, key_path).ok_or_else(|| {
                TransferError::DecodeFailure(format!("row {} has no usable {:?} key", i, key_path))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let count = records.len();
    for record in records {
        db.put(record)?;
    }

    debug!(table, rows = count, "stored rows");
    Ok(count)
}

/// Cloneable entry point to a running [`TransferService`].
#[derive(Debug, Clone)]
pub struct TransferHandle {
    sender: mpsc::Sender<Request>,
    identity: Arc<StoreIdentity>,
}

impl TransferHandle {
    /// Identity of the live database.
    pub fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Loads one record by key, or the whole table when `key` is `None` or empty.
    pub async fn load_data(&self, table: &str, key: Option<&str>) -> Result<TransferBuffer> {
        self.call(|reply| Request::Load {
            table: table.to_string(),
            key: key.map(str::to_string),
            reply,
        })
        .await
    }

    /// Writes one record or an array of records. Returns the number written.
    pub async fn put_data(&self, buffer: TransferBuffer, table: &str) -> Result<usize> {
        self.call(|reply| Request::Put {
            buffer,
            table: table.to_string(),
            reply,
        })
        .await
    }

    pub async fn export_data<M, T>(
        &self,
        progress: Arc<dyn ProgressSink>,
        map_ids: M,
        token_ids: T,
    ) -> Result<TransferBuffer>
    where
        M: IntoIterator,
        M::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let filter = ExportFilter::new(map_ids, token_ids);
        self.call(|reply| Request::Export {
            filter,
            progress,
            reply,
        })
        .await
    }

    /// Imports a snapshot into the staging database `database_name`.
    pub async fn import_data(
        &self,
        buffer: TransferBuffer,
        database_name: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<ImportReport> {
        self.call(|reply| Request::Import {
            buffer,
            target: database_name.to_string(),
            progress,
            reply,
        })
        .await
    }

    /// Stops accepting requests. Operations already running finish normally.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(Request::Shutdown).await;
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(request(reply))
            .await
            .map_err(|_| TransferError::ServiceClosed)?;
        response.await.map_err(|_| TransferError::ServiceClosed)?
    }
}
