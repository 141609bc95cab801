pub mod types;

pub use types::{DocumentRecord, PageKey, PageRecord, PageStatus};
