use crate::store::TableName;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub table: TableName,
    pub completed: u64,
    /// `None` when the total is not known in advance.
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(table: &str, completed: u64, total: Option<u64>) -> Self {
        Self {
            table: table.to_string(),
            completed,
            total,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total == Some(self.completed)
    }
}

/// Receiver of progress notifications. Reports are fire-and-forget: a sink
/// must return promptly and the pipelines never wait on it.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress(UnboundedSender<ProgressEvent>);

impl ChannelProgress {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self(sender)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.0.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}
