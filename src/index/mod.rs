//! Index store and query engine

pub mod entry;
pub mod query;
pub mod store;

pub use entry::{FileRef, IndexEntry};
pub use query::{parse_query, Query, QueryEngine, QueryFilter, SearchHit, TextMatch};
pub use store::IndexStore;
