use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// FIFO/claim/commit contract shared by the queue implementations.
///
/// An item is exclusively owned by the queue until `get` returns it, then by
/// the claiming worker until `commit` acknowledges it. Claims are committed
/// in claim order, which is exact for the single-consumer loops this crate
/// runs per route.
#[async_trait]
pub trait Queue<T>: Send + Sync {
    async fn put(&self, item: T) -> Result<()>;

    /// Claim the next item, suspending until one is available.
    async fn get(&self) -> Result<T>;

    /// Bounded-wait claim, so idle workers can still observe shutdown.
    async fn get_timeout(&self, wait: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(wait, self.get()).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Acknowledge the oldest uncommitted claim.
    async fn commit(&self) -> Result<()>;

    /// Number of currently visible (unclaimed) items.
    async fn size(&self) -> usize;

    /// Suspend until the queue is empty and every claimed item is committed.
    async fn teardown(&self) -> Result<()>;
}
