use async_trait::async_trait;

use crate::error::Result;
use crate::queue::{MessageKind, QueueMessage};

/// Sink for one batch of queue messages of a single kind.
///
/// Each drain loop owns its own store, so an implementation never sees
/// concurrent calls and a failure in one kind cannot poison another.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimeSeriesStore: Send {
    /// Write `batch` atomically and return the number of rows written
    async fn write_batch(&mut self, kind: MessageKind, batch: &[QueueMessage]) -> Result<u64>;
}
