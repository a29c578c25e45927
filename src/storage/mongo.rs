use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, ReplaceOptions};
use mongodb::{Client, Collection as MongoCollection, Database};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::StorageSettings;
use crate::crawler::task::WorkItem;
use crate::storage::store::{Collection, RecordFilter, RecordStore, RetrievalOrder, StoreError};

/// MongoDB implementation of RecordStore.
///
/// Each record document is a serialized `WorkItem` plus a `seq` field that
/// orders documents by insertion.
pub struct MongoStore {
    database: Database,
    seq: AtomicI64,
}

fn backend(e: mongodb::error::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn filter_document(filter: &RecordFilter) -> Document {
    match filter {
        RecordFilter::All => doc! {},
        RecordFilter::Key(key) => doc! { "key": key },
        RecordFilter::Url(url) => doc! { "url": url },
    }
}

impl MongoStore {
    /// Connect to MongoDB, using `namespace` to name the database
    pub async fn new(settings: &StorageSettings, namespace: &str) -> Result<Self, StoreError> {
        let client_options = ClientOptions::parse(&settings.connection_string).await.map_err(backend)?;
        let client = Client::with_options(client_options).map_err(backend)?;
        let database = client.database(&format!("{}_{}", settings.database_name, namespace));

        // Test connection
        database.list_collection_names(None).await.map_err(backend)?;

        debug!("Connected to MongoDB database: {}", database.name());

        Ok(Self {
            database,
            // Microsecond start keeps seq increasing across restarts
            seq: AtomicI64::new(Utc::now().timestamp_micros()),
        })
    }

    fn collection(&self, collection: Collection) -> MongoCollection<Document> {
        self.database.collection(collection.name())
    }

    fn to_document(&self, item: &WorkItem, seq: Option<i64>) -> Result<Document, StoreError> {
        let mut record = item.clone();
        record.id.get_or_insert_with(|| Uuid::new_v4().to_string());

        let mut document = bson::to_document(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let seq = seq.unwrap_or_else(|| self.seq.fetch_add(1, Ordering::SeqCst));
        document.insert("seq", seq);
        Ok(document)
    }

    fn from_document(document: Document) -> Result<WorkItem, StoreError> {
        bson::from_document(document).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn find_sorted(
        &self,
        filter: Document,
        order: RetrievalOrder,
        limit: Option<usize>,
        collection: Collection,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let direction = match order {
            RetrievalOrder::Oldest => 1,
            RetrievalOrder::Newest => -1,
        };
        let options = FindOptions::builder()
            .sort(doc! { "seq": direction })
            .limit(limit.map(|n| n as i64))
            .build();

        let mut cursor = self.collection(collection).find(filter, options).await.map_err(backend)?;
        let mut items = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(backend)? {
            items.push(Self::from_document(document)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl RecordStore for MongoStore {
    async fn insert(&self, item: &WorkItem, collection: Collection) -> Result<(), StoreError> {
        let document = self.to_document(item, None)?;
        self.collection(collection).insert_one(document, None).await.map_err(backend)?;
        Ok(())
    }

    async fn upsert(&self, item: &WorkItem, collection: Collection) -> Result<bool, StoreError> {
        let coll = self.collection(collection);
        let filter = doc! { "key": &item.key };

        // Keep the identity and position of an existing record
        let existing = coll.find_one(filter.clone(), None).await.map_err(backend)?;
        let mut record = item.clone();
        let mut seq = None;
        if let Some(existing) = &existing {
            record.id = existing.get_str("_id").ok().map(str::to_string);
            seq = existing.get_i64("seq").ok();
        }

        let document = self.to_document(&record, seq)?;
        let result = coll
            .replace_one(filter, document, ReplaceOptions::builder().upsert(true).build())
            .await
            .map_err(backend)?;

        Ok(result.upserted_id.is_some())
    }

    async fn get_one(&self, key: &str, collection: Collection) -> Result<Option<WorkItem>, StoreError> {
        let document = self
            .collection(collection)
            .find_one(doc! { "key": key }, None)
            .await
            .map_err(backend)?;

        document.map(Self::from_document).transpose()
    }

    async fn get_many(
        &self,
        count: usize,
        order: RetrievalOrder,
        auto_remove: bool,
        collection: Collection,
    ) -> Result<Vec<WorkItem>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let items = self.find_sorted(doc! {}, order, Some(count), collection).await?;

        if auto_remove && !items.is_empty() {
            let ids: Vec<Bson> = items
                .iter()
                .filter_map(|item| item.id.clone())
                .map(Bson::String)
                .collect();
            self.collection(collection)
                .delete_many(doc! { "_id": { "$in": ids } }, None)
                .await
                .map_err(backend)?;
        }

        Ok(items)
    }

    async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        let count = self
            .collection(collection)
            .count_documents(doc! {}, None)
            .await
            .map_err(backend)?;
        Ok(count as usize)
    }

    async fn bulk_insert(&self, items: &[WorkItem], collection: Collection) -> Result<usize, StoreError> {
        let mut batch_ids = HashSet::new();
        for id in items.iter().filter_map(|item| item.id.as_ref()) {
            if !batch_ids.insert(id.clone()) {
                return Err(StoreError::DuplicateId(id.clone()));
            }
        }

        let coll = self.collection(collection);
        if !batch_ids.is_empty() {
            let ids: Vec<Bson> = batch_ids.iter().cloned().map(Bson::String).collect();
            if let Some(taken) = coll
                .find_one(doc! { "_id": { "$in": ids } }, None)
                .await
                .map_err(backend)?
            {
                let id = taken.get_str("_id").unwrap_or_default().to_string();
                return Err(StoreError::DuplicateId(id));
            }
        }

        let mut seen_keys = HashSet::new();
        let mut documents = Vec::new();
        for item in items {
            if seen_keys.insert(item.key.as_str()) {
                documents.push(self.to_document(item, None)?);
            }
        }

        if documents.is_empty() {
            return Ok(0);
        }

        let result = coll.insert_many(documents, None).await.map_err(backend)?;
        debug!("Bulk inserted {} records into {}", result.inserted_ids.len(), collection.name());

        Ok(result.inserted_ids.len())
    }

    async fn find(&self, filter: &RecordFilter, collection: Collection) -> Result<Vec<WorkItem>, StoreError> {
        self.find_sorted(filter_document(filter), RetrievalOrder::Oldest, None, collection).await
    }

    async fn delete(&self, filter: &RecordFilter, collection: Collection) -> Result<usize, StoreError> {
        let result = self
            .collection(collection)
            .delete_many(filter_document(filter), None)
            .await
            .map_err(backend)?;
        Ok(result.deleted_count as usize)
    }

    async fn drop_collection(&self, collection: Collection) -> Result<(), StoreError> {
        self.collection(collection).drop(None).await.map_err(backend)
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        debug!("Releasing MongoDB database: {}", self.database.name());
        Ok(())
    }

    async fn delete_store(&self) -> Result<(), StoreError> {
        self.database.drop(None).await.map_err(backend)?;
        debug!("Dropped MongoDB database: {}", self.database.name());
        Ok(())
    }
}
