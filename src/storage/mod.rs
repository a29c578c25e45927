pub mod memory;
pub mod mongo;
pub mod store;

use std::sync::Arc;
use tracing::info;

use crate::cli::config::StorageSettings;

// Re-export common types
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use store::{Collection, RecordFilter, RecordStore, RetrievalOrder, StoreError};

/// Open the record store named by `settings.backend`.
///
/// `namespace` separates stores of different roles (host, worker, crawl)
/// sharing one backend.
pub async fn open_store(settings: &StorageSettings, namespace: &str) -> Result<Arc<dyn RecordStore>, StoreError> {
    match settings.backend.as_str() {
        "memory" => {
            info!("Using in-memory record store for {}", namespace);
            Ok(Arc::new(MemoryStore::new()))
        }
        "mongodb" => {
            info!("Using MongoDB record store for {}", namespace);
            Ok(Arc::new(MongoStore::new(settings, namespace).await?))
        }
        other => Err(StoreError::Backend(format!("Unsupported storage backend: {}", other))),
    }
}
