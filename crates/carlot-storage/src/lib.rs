//! Durable listing store, cursor query engine and HTTP fetch utilities for carlot.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RequestPacer, RetryDisposition,
};
pub use memory::MemoryListingStore;
pub use postgres::PgListingStore;
pub use query::{CursorQueryEngine, QueryConfig, QueryError};
pub use store::{ListingStore, StoreError, UpsertOutcome, UpsertRow};

pub const CRATE_NAME: &str = "carlot-storage";
