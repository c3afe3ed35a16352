//! A fixed pool of workers draining one rendezvous channel.
//!
//! Backup, restore, and delete all use the same shape: the command's main
//! task produces string items (paths or object keys), `workers` tasks
//! consume them until the channel closes. An item failure is logged and
//! counted, never propagated to peers; the caller decides at `join` time
//! whether any failures are fatal.

use std::future::Future;

use async_channel::{Receiver, Sender};
use pgferry_core::{Error, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct WorkerPool {
    tx: Sender<String>,
    handles: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    pub fn spawn<H, Fut>(workers: usize, handler: H) -> Self
    where
        H: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = async_channel::bounded::<String>(1);
        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), handler.clone())))
            .collect();

        Self { tx, handles }
    }

    /// A sender for producers that push items themselves, e.g. a storage
    /// walk. Dropping the clone does not close the pool's channel.
    pub fn sender(&self) -> Sender<String> {
        self.tx.clone()
    }

    pub async fn dispatch(&self, item: String) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| Error::Other("worker pool channel closed".to_string()))
    }

    /// Close the channel and wait for every worker to drain. Returns the
    /// number of items that failed.
    pub async fn join(self) -> u64 {
        drop(self.tx);

        let mut failed = 0;
        for handle in self.handles {
            match handle.await {
                Ok(n) => failed += n,
                Err(err) => {
                    error!(error = %err, "worker task panicked");
                    failed += 1;
                }
            }
        }

        failed
    }
}

async fn worker_loop<H, Fut>(id: usize, rx: Receiver<String>, handler: H) -> u64
where
    H: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failed = 0u64;

    while let Ok(item) = rx.recv().await {
        if let Err(err) = handler(item.clone()).await {
            error!(worker = id, item = %item, error = %err, "failed to process item");
            failed += 1;
        }
    }

    debug!(worker = id, "no more items to process");
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_items_are_processed() {
        let processed = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::spawn(4, {
            let processed = processed.clone();
            move |_item: String| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        for i in 0..100 {
            pool.dispatch(format!("item-{}", i)).await.unwrap();
        }
        let failed = pool.join().await;

        assert_eq!(failed, 0);
        assert_eq!(processed.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let pool = WorkerPool::spawn(2, |item: String| async move {
            if item.ends_with('3') {
                Err(Error::Other(format!("cannot process {}", item)))
            } else {
                Ok(())
            }
        });

        for i in 0..10 {
            pool.dispatch(format!("item-{}", i)).await.unwrap();
        }
        let failed = pool.join().await;

        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_join_with_no_items() {
        let pool = WorkerPool::spawn(3, |_item: String| async move { Ok(()) });
        assert_eq!(pool.join().await, 0);
    }
}
