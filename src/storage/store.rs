use async_trait::async_trait;
use thiserror::Error;

use crate::crawler::task::WorkItem;

/// Named record collections used by the crawler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// URLs that were crawled successfully
    CrawledHistory,
    /// Frontier items that did not fit in memory
    CachedBacklog,
    /// In-memory frontier saved at shutdown for the next run
    DumpedBacklog,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::CrawledHistory => "crawled",
            Collection::CachedBacklog => "cached_backlog",
            Collection::DumpedBacklog => "dumped_backlog",
        }
    }
}

/// Which end of a collection `get_many` reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOrder {
    /// Earliest inserted first
    Oldest,
    /// Latest inserted first
    Newest,
}

/// Record selection for `find` and `delete`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    Key(String),
    Url(String),
}

impl RecordFilter {
    pub fn matches(&self, item: &WorkItem) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Key(key) => item.key == *key,
            RecordFilter::Url(url) => item.url == *url,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate record id: {0}")]
    DuplicateId(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Keyed record store backing frontier overflow and crawl history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record, assigning an id if it has none
    async fn insert(&self, item: &WorkItem, collection: Collection) -> Result<(), StoreError>;

    /// Insert or replace the record with the same key; true if inserted
    async fn upsert(&self, item: &WorkItem, collection: Collection) -> Result<bool, StoreError>;

    /// Get the record with the given key
    async fn get_one(&self, key: &str, collection: Collection) -> Result<Option<WorkItem>, StoreError>;

    /// Read up to `count` records in the given order, optionally removing them
    async fn get_many(
        &self,
        count: usize,
        order: RetrievalOrder,
        auto_remove: bool,
        collection: Collection,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Number of records in a collection
    async fn count(&self, collection: Collection) -> Result<usize, StoreError>;

    /// Insert a batch. Records repeating a key within the batch are skipped;
    /// a repeated explicit id fails the whole batch with nothing inserted.
    async fn bulk_insert(&self, items: &[WorkItem], collection: Collection) -> Result<usize, StoreError>;

    /// All records matching a filter, oldest first
    async fn find(&self, filter: &RecordFilter, collection: Collection) -> Result<Vec<WorkItem>, StoreError>;

    /// Remove records matching a filter; returns how many were removed
    async fn delete(&self, filter: &RecordFilter, collection: Collection) -> Result<usize, StoreError>;

    async fn drop_collection(&self, collection: Collection) -> Result<(), StoreError>;

    /// Release the backend connection
    async fn dispose(&self) -> Result<(), StoreError>;

    /// Remove every collection of this store
    async fn delete_store(&self) -> Result<(), StoreError>;
}
