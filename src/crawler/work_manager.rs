use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::backlog::{Backlog, BacklogMode};
use crate::crawler::task::WorkItem;
use crate::storage::{Collection, RecordFilter, RecordStore, RetrievalOrder};

/// How the frontier relates to the rest of the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierRole {
    /// Authoritative frontier (host, or standalone crawler); saved on shutdown
    Authoritative,
    /// Local cache of work handed out by a host; discarded on shutdown
    HostFed,
}

/// Frontier that keeps at most `memory_limit` items resident and spills the
/// rest to the record store.
///
/// `total_work_count() == resident_count() + overflow_count()` holds after
/// every completed mutating call. All mutation goes through `guard`.
pub struct WorkManager {
    backlog: Backlog<WorkItem>,
    store: Arc<dyn RecordStore>,
    memory_limit: usize,
    role: FrontierRole,
    overflow: AtomicUsize,
    guard: Mutex<()>,
}

impl WorkManager {
    /// Create a work manager; `depth_first` selects LIFO ordering
    pub async fn new(
        store: Arc<dyn RecordStore>,
        memory_limit: usize,
        depth_first: bool,
        role: FrontierRole,
    ) -> Result<Self> {
        let mode = if depth_first { BacklogMode::Stack } else { BacklogMode::Queue };

        // Overflow left over from an earlier run is still part of the frontier
        let overflow = store
            .count(Collection::CachedBacklog)
            .await
            .context("Failed to count cached backlog")?;

        Ok(Self {
            backlog: Backlog::with_key(mode, |item: &WorkItem| item.key.clone()),
            store,
            memory_limit: memory_limit.max(1),
            role,
            overflow: AtomicUsize::new(overflow),
            guard: Mutex::new(()),
        })
    }

    pub fn is_fifo(&self) -> bool {
        self.backlog.mode() == BacklogMode::Queue
    }

    pub fn role(&self) -> FrontierRole {
        self.role
    }

    pub fn resident_count(&self) -> usize {
        self.backlog.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.load(Ordering::Acquire)
    }

    /// Number of accepted URLs not yet handed out (may be momentarily stale)
    pub fn total_work_count(&self) -> usize {
        self.resident_count() + self.overflow_count()
    }

    /// Restore the frontier saved by the previous run, then queue the seeds
    /// that have not been crawled yet
    pub async fn initialize(&self, seeds: &[String]) -> Result<()> {
        let dumped_count = self
            .store
            .count(Collection::DumpedBacklog)
            .await
            .context("Failed to count dumped backlog")?;

        if dumped_count > 0 {
            let dumped = self
                .store
                .get_many(dumped_count, RetrievalOrder::Oldest, true, Collection::DumpedBacklog)
                .await
                .context("Failed to load dumped backlog")?;
            let urls: Vec<String> = dumped.into_iter().map(|item| item.url).collect();
            info!("Restoring {} URLs from the previous run", urls.len());
            self.add_many(urls).await?;
        }

        let mut fresh = Vec::new();
        for seed in seeds {
            if self.is_eligible_for_crawl(seed).await? {
                fresh.push(seed.clone());
            } else {
                debug!("Seed already known, skipping: {}", seed);
            }
        }
        if !fresh.is_empty() {
            self.add_many(fresh).await?;
        }

        info!(
            "Frontier ready: {} resident, {} overflowed",
            self.resident_count(),
            self.overflow_count()
        );
        Ok(())
    }

    /// Accept a single URL into the frontier
    pub async fn add_one(&self, url: impl Into<String>) -> Result<()> {
        let _guard = self.guard.lock().await;
        let item = WorkItem::new(url);

        // Once anything has spilled, new arrivals queue behind it
        if self.backlog.len() >= self.memory_limit || self.overflow_count() > 0 {
            self.store
                .insert(&item, Collection::CachedBacklog)
                .await
                .context("Failed to spill work item to storage")?;
            self.overflow.fetch_add(1, Ordering::AcqRel);
            debug!("Spilled to storage: {}", item.url);
        } else {
            self.backlog.push(item);
        }

        self.load_cache_to_memory().await
    }

    /// Accept a batch of URLs; whatever does not fit in memory is spilled in
    /// one bulk write
    pub async fn add_many(&self, urls: Vec<String>) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }

        let _guard = self.guard.lock().await;
        let room = if self.overflow_count() > 0 {
            0
        } else {
            self.memory_limit.saturating_sub(self.backlog.len())
        };

        let mut items: Vec<WorkItem> = urls.into_iter().map(WorkItem::new).collect();
        let spilled = items.split_off(room.min(items.len()));
        self.backlog.push_many(items);

        if !spilled.is_empty() {
            let inserted = self
                .persist_batch(&spilled, Collection::CachedBacklog)
                .await
                .context("Failed to spill work batch to storage")?;
            self.overflow.fetch_add(inserted, Ordering::AcqRel);
        }

        self.load_cache_to_memory().await
    }

    /// Next URL to crawl, or None once memory and storage are both drained
    pub async fn get_next(&self) -> Result<Option<String>> {
        let _guard = self.guard.lock().await;

        // In depth-first mode the newest items are the ones that spilled
        let item = if !self.is_fifo() && self.overflow_count() > 0 {
            match self.take_from_storage(RetrievalOrder::Newest).await? {
                Some(item) => Some(item),
                None => self.backlog.pop(),
            }
        } else {
            match self.backlog.pop() {
                Some(item) => Some(item),
                None if self.overflow_count() > 0 => self.take_from_storage(RetrievalOrder::Oldest).await?,
                None => None,
            }
        };

        self.load_cache_to_memory().await?;
        Ok(item.map(|item| item.url))
    }

    /// Whether a URL is neither queued in memory nor already crawled.
    ///
    /// Point-in-time check: two concurrent callers may both see true.
    pub async fn is_eligible_for_crawl(&self, url: &str) -> Result<bool> {
        let key = WorkItem::key_for(url);
        let truncated = WorkItem::is_key_truncated(url);

        if self.backlog.contains_key(&key) {
            if !truncated || self.backlog.find(|item| item.url == url).is_some() {
                return Ok(false);
            }
        }

        let crawled = if truncated {
            !self
                .store
                .find(&RecordFilter::Url(url.to_string()), Collection::CrawledHistory)
                .await
                .context("Failed to query crawl history")?
                .is_empty()
        } else {
            self.store
                .get_one(&key, Collection::CrawledHistory)
                .await
                .context("Failed to query crawl history")?
                .is_some()
        };

        Ok(!crawled)
    }

    /// Record the outcome of crawling a URL; repeated successes keep one record
    pub async fn report_result(&self, url: &str, success: bool) -> Result<()> {
        if !success {
            debug!("Crawl failed, not recording history: {}", url);
            return Ok(());
        }

        let inserted = self
            .store
            .upsert(&WorkItem::crawled(url), Collection::CrawledHistory)
            .await
            .context("Failed to record crawl result")?;
        debug!("Recorded crawl of {} (new record: {})", url, inserted);
        Ok(())
    }

    /// Save or discard local state before the process exits
    pub async fn dispose(&self) -> Result<()> {
        let _guard = self.guard.lock().await;

        match self.role {
            FrontierRole::Authoritative => {
                let remaining = self.backlog.take_all();
                if !remaining.is_empty() {
                    match self.persist_batch(&remaining, Collection::DumpedBacklog).await {
                        Ok(saved) => info!("Dumped {} frontier URLs for the next run", saved),
                        Err(e) => {
                            // Keep the work resident so a retry can still save it
                            self.backlog.push_many(remaining);
                            return Err(e).context("Failed to dump backlog");
                        }
                    }
                }
            }
            FrontierRole::HostFed => {
                self.backlog.clear();
                self.overflow.store(0, Ordering::Release);
                self.store.delete_store().await.context("Failed to delete local store")?;
                info!("Discarded local frontier cache");
            }
        }

        self.store.dispose().await.context("Failed to close storage")?;
        Ok(())
    }

    async fn take_from_storage(&self, order: RetrievalOrder) -> Result<Option<WorkItem>> {
        let mut items = self
            .store
            .get_many(1, order, true, Collection::CachedBacklog)
            .await
            .context("Failed to read cached backlog")?;

        match items.pop() {
            Some(item) => {
                self.overflow.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(item))
            }
            None => {
                self.resync_overflow().await?;
                Ok(None)
            }
        }
    }

    /// Bulk-write `items` in order, dropping exact repeats. Distinct URLs
    /// that share a truncated key go into separate writes, since a single
    /// bulk write keeps only one record per key.
    async fn persist_batch(&self, items: &[WorkItem], collection: Collection) -> Result<usize> {
        let mut seen_urls = HashSet::new();
        let mut chunk: Vec<WorkItem> = Vec::new();
        let mut chunk_keys = HashSet::new();
        let mut written = 0;

        for item in items {
            if !seen_urls.insert(item.url.as_str()) {
                debug!("Dropping repeated URL from batch: {}", item.url);
                continue;
            }
            if !chunk_keys.insert(item.key.as_str()) {
                written += self.write_chunk(&chunk, collection).await?;
                chunk.clear();
                chunk_keys.clear();
                chunk_keys.insert(item.key.as_str());
            }
            chunk.push(item.clone());
        }

        written += self.write_chunk(&chunk, collection).await?;
        Ok(written)
    }

    async fn write_chunk(&self, chunk: &[WorkItem], collection: Collection) -> Result<usize> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let written = self.store.bulk_insert(chunk, collection).await?;
        Ok(written)
    }

    /// Move spilled items back into memory while there is room.
    ///
    /// Always takes the oldest stored items. Anything that reaches storage
    /// is newer than what is resident, so in LIFO mode storage stays the
    /// newest part of the frontier and `get_next` can keep preferring it.
    async fn load_cache_to_memory(&self) -> Result<()> {
        let room = self.memory_limit.saturating_sub(self.backlog.len());
        let overflow = self.overflow_count();
        if room == 0 || overflow == 0 {
            return Ok(());
        }

        let items = self
            .store
            .get_many(room.min(overflow), RetrievalOrder::Oldest, true, Collection::CachedBacklog)
            .await
            .context("Failed to load cached backlog into memory")?;

        if items.is_empty() {
            return self.resync_overflow().await;
        }

        self.overflow.fetch_sub(items.len().min(overflow), Ordering::AcqRel);
        debug!("Loaded {} cached items into memory", items.len());
        self.backlog.push_many(items);
        Ok(())
    }

    async fn resync_overflow(&self) -> Result<()> {
        let actual = self
            .store
            .count(Collection::CachedBacklog)
            .await
            .context("Failed to count cached backlog")?;
        warn!(
            "Overflow counter out of sync ({} recorded, {} stored); resetting",
            self.overflow_count(),
            actual
        );
        self.overflow.store(actual, Ordering::Release);
        Ok(())
    }
}
