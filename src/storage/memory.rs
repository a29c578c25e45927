use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::crawler::task::WorkItem;
use crate::storage::store::{Collection, RecordFilter, RecordStore, RetrievalOrder, StoreError};

#[derive(Default)]
struct Records {
    /// Insertion sequence -> record
    by_seq: BTreeMap<u64, WorkItem>,
    /// Record id -> insertion sequence
    ids: HashMap<String, u64>,
}

impl Records {
    fn push(&mut self, seq: u64, mut item: WorkItem) {
        let id = item.id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone();
        self.ids.insert(id, seq);
        self.by_seq.insert(seq, item);
    }

    fn remove(&mut self, seq: u64) -> Option<WorkItem> {
        let item = self.by_seq.remove(&seq)?;
        if let Some(id) = &item.id {
            self.ids.remove(id);
        }
        Some(item)
    }

    fn seq_of_key(&self, key: &str) -> Option<u64> {
        self.by_seq.iter().find(|(_, item)| item.key == key).map(|(seq, _)| *seq)
    }
}

#[derive(Default)]
struct State {
    collections: HashMap<Collection, Records>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// In-process record store; contents live as long as the store does
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, item: &WorkItem, collection: Collection) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(id) = &item.id {
            if state.collections.get(&collection).map_or(false, |r| r.ids.contains_key(id)) {
                return Err(StoreError::DuplicateId(id.clone()));
            }
        }

        let seq = state.next_seq();
        state.collections.entry(collection).or_default().push(seq, item.clone());
        Ok(())
    }

    async fn upsert(&self, item: &WorkItem, collection: Collection) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        let records = state.collections.entry(collection).or_default();

        match records.seq_of_key(&item.key) {
            Some(existing) => {
                let mut replacement = item.clone();
                if let Some(current) = records.by_seq.get(&existing) {
                    replacement.id = current.id.clone();
                }
                records.by_seq.insert(existing, replacement);
                Ok(false)
            }
            None => {
                records.push(seq, item.clone());
                Ok(true)
            }
        }
    }

    async fn get_one(&self, key: &str, collection: Collection) -> Result<Option<WorkItem>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .collections
            .get(&collection)
            .and_then(|records| records.by_seq.values().find(|item| item.key == key).cloned()))
    }

    async fn get_many(
        &self,
        count: usize,
        order: RetrievalOrder,
        auto_remove: bool,
        collection: Collection,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut state = self.state.lock();
        let Some(records) = state.collections.get_mut(&collection) else {
            return Ok(Vec::new());
        };

        let seqs: Vec<u64> = match order {
            RetrievalOrder::Oldest => records.by_seq.keys().take(count).copied().collect(),
            RetrievalOrder::Newest => records.by_seq.keys().rev().take(count).copied().collect(),
        };

        let items = if auto_remove {
            seqs.into_iter().filter_map(|seq| records.remove(seq)).collect()
        } else {
            seqs.iter().filter_map(|seq| records.by_seq.get(seq).cloned()).collect()
        };
        Ok(items)
    }

    async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        let state = self.state.lock();
        Ok(state.collections.get(&collection).map_or(0, |r| r.by_seq.len()))
    }

    async fn bulk_insert(&self, items: &[WorkItem], collection: Collection) -> Result<usize, StoreError> {
        let mut state = self.state.lock();

        // Validate explicit ids before touching anything
        let mut batch_ids = HashSet::new();
        for id in items.iter().filter_map(|item| item.id.as_ref()) {
            let taken = state.collections.get(&collection).map_or(false, |r| r.ids.contains_key(id));
            if taken || !batch_ids.insert(id) {
                return Err(StoreError::DuplicateId(id.clone()));
            }
        }

        let mut seen_keys = HashSet::new();
        let mut inserted = 0;
        for item in items {
            if !seen_keys.insert(item.key.as_str()) {
                continue;
            }
            let seq = state.next_seq();
            state.collections.entry(collection).or_default().push(seq, item.clone());
            inserted += 1;
        }

        debug!("Bulk inserted {} records into {}", inserted, collection.name());
        Ok(inserted)
    }

    async fn find(&self, filter: &RecordFilter, collection: Collection) -> Result<Vec<WorkItem>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .collections
            .get(&collection)
            .map(|records| records.by_seq.values().filter(|item| filter.matches(item)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, filter: &RecordFilter, collection: Collection) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let Some(records) = state.collections.get_mut(&collection) else {
            return Ok(0);
        };

        let doomed: Vec<u64> = records
            .by_seq
            .iter()
            .filter(|(_, item)| filter.matches(item))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            records.remove(*seq);
        }
        Ok(doomed.len())
    }

    async fn drop_collection(&self, collection: Collection) -> Result<(), StoreError> {
        self.state.lock().collections.remove(&collection);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_store(&self) -> Result<(), StoreError> {
        self.state.lock().collections.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn item(url: &str) -> WorkItem {
        WorkItem::new(url)
    }

    #[tokio::test]
    async fn get_many_respects_order_and_removal() {
        let store = MemoryStore::new();
        for url in ["a", "b", "c"] {
            store.insert(&item(url), Collection::CachedBacklog).await.unwrap();
        }

        let newest = store.get_many(2, RetrievalOrder::Newest, false, Collection::CachedBacklog).await.unwrap();
        let urls: Vec<_> = newest.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["c", "b"]);
        assert_eq!(store.count(Collection::CachedBacklog).await.unwrap(), 3);

        let oldest = store.get_many(1, RetrievalOrder::Oldest, true, Collection::CachedBacklog).await.unwrap();
        assert_eq!(oldest[0].url, "a");
        assert!(oldest[0].id.is_some());
        assert_eq!(store.count(Collection::CachedBacklog).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let store = MemoryStore::new();
        assert!(store.upsert(&item("a"), Collection::CrawledHistory).await.unwrap());
        assert!(!store.upsert(&WorkItem::crawled("a"), Collection::CrawledHistory).await.unwrap());

        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 1);
        let stored = store.get_one("a", Collection::CrawledHistory).await.unwrap().unwrap();
        assert!(stored.is_downloaded);
    }

    #[tokio::test]
    async fn bulk_insert_skips_repeated_keys() {
        let store = MemoryStore::new();
        let batch = vec![item("a"), item("b"), item("a")];

        let inserted = store.bulk_insert(&batch, Collection::DumpedBacklog).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.count(Collection::DumpedBacklog).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn bulk_insert_with_duplicate_ids_inserts_nothing() {
        let store = MemoryStore::new();
        let mut first = item("a");
        first.id = Some("same".to_string());
        let mut second = item("b");
        second.id = Some("same".to_string());

        assert_err!(store.bulk_insert(&[item("c"), first, second], Collection::DumpedBacklog).await);
        assert_eq!(store.count(Collection::DumpedBacklog).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_and_delete_use_filters() {
        let store = MemoryStore::new();
        store.insert(&item("a"), Collection::CrawledHistory).await.unwrap();
        store.insert(&item("b"), Collection::CrawledHistory).await.unwrap();

        let found = store.find(&RecordFilter::Url("b".to_string()), Collection::CrawledHistory).await.unwrap();
        assert_eq!(found.len(), 1);

        let removed = store.delete(&RecordFilter::Key("a".to_string()), Collection::CrawledHistory).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 1);

        store.drop_collection(Collection::CrawledHistory).await.unwrap();
        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_store_clears_every_collection() {
        let store = MemoryStore::new();
        store.insert(&item("a"), Collection::CachedBacklog).await.unwrap();
        store.insert(&item("b"), Collection::CrawledHistory).await.unwrap();

        store.delete_store().await.unwrap();
        assert_eq!(store.count(Collection::CachedBacklog).await.unwrap(), 0);
        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 0);
    }
}
