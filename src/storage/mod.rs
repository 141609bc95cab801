//! Durable page status store.

pub mod sqlite;

use std::sync::Arc;

pub use sqlite::{CleanupReport, PageStore, StatusCounts, StatusUpdate};

/// Store handle shared between the ingestion server and the queue.
pub type SharedStore = Arc<parking_lot::Mutex<PageStore>>;

pub fn shared(store: PageStore) -> SharedStore {
    Arc::new(parking_lot::Mutex::new(store))
}
