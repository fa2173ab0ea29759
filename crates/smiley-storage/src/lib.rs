//! Feed retrieval and document persistence for the smiley sync.

mod fetch;
mod memory;
mod postgres;
mod store;

pub use fetch::{sha256_hex, FeedFetcher, FeedSource, FetchError, FetchedFeed, HttpClientConfig};
pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;
pub use store::{validate_collection_name, ApplyError, DocumentStore, StoreError};

pub const CRATE_NAME: &str = "smiley-storage";
