//! Persistent item storage seam.
//!
//! The store is the source of truth for a thread: an ordered, append-only
//! list of [`Item`]s. The context pipeline never writes back to it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use crate::Item;

/// Boxed future returned by [`ItemStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item store unavailable: {0}")]
    Unavailable(String),
    #[error("item store error: {0}")]
    Backend(String),
}

/// Append-only item storage keyed by thread id.
pub trait ItemStore: Send + Sync {
    fn append_item<'a>(&'a self, thread_id: &'a str, item: Item) -> StoreFuture<'a, ()>;

    /// All items of a thread, oldest first. Unknown threads are empty.
    fn list_items<'a>(&'a self, thread_id: &'a str) -> StoreFuture<'a, Vec<Item>>;
}

/// Process-local store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryItemStore {
    threads: RwLock<HashMap<String, Vec<Item>>>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one item.
    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }
}

impl ItemStore for InMemoryItemStore {
    fn append_item<'a>(&'a self, thread_id: &'a str, item: Item) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.threads
                .write()
                .await
                .entry(thread_id.to_string())
                .or_default()
                .push(item);
            Ok(())
        })
    }

    fn list_items<'a>(&'a self, thread_id: &'a str) -> StoreFuture<'a, Vec<Item>> {
        Box::pin(async move {
            Ok(self
                .threads
                .read()
                .await
                .get(thread_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}
