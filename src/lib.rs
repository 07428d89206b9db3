#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # rate-limit-mongo
//!
//! MongoDB-backed counter store for fixed-window request rate limiting.
//!
//! The store persists one `{ key, totalHits, resetTime }` document per
//! client and exposes the mutation protocol an admission-control middleware
//! needs: `get`, `increment`, `decrement`, `reset_key`, `reset_all`. Every
//! mutating hit is a single server-side atomic upsert that also rolls the
//! window expiry forward to `now + window`, so concurrent hits against the
//! same key can never lose updates, and expired records are swept passively
//! by a TTL index rather than explicit deletes.
//!
//! ## Features
//!
//! - **Atomic counter protocol** — no client-side read-modify-write races
//! - **Rolling fixed window** — expiry refreshed on every mutating access
//! - **Passive expiry** — TTL index on `resetTime`, declared idempotently
//! - **Pluggable backend** — [`DocumentStore`] seam with an in-memory
//!   implementation for tests
//! - **Explicit lifecycle** — operations are refused until `init` has
//!   actually established the connection
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rate_limit_mongo::{CounterStore, MongoDocumentStore, MongoStoreOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend =
//!         MongoDocumentStore::new(MongoStoreOptions::new("mongodb://localhost:27017")).await?;
//!     let store = CounterStore::builder(backend)
//!         .local_keys(true)
//!         .build();
//!
//!     store.init(Duration::from_secs(60)).await?;
//!     let info = store.increment("203.0.113.7").await?;
//!     println!("{} hits, window resets at {:?}", info.total_hits, info.reset_time);
//!
//!     store.close(false).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod key;
pub mod mongo;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    CounterStore, CounterStoreBuilder, Lifecycle, RateLimitInfo, DEFAULT_WINDOW,
};
pub use error::StoreError;
pub use key::{KeyCodec, DEFAULT_PREFIX};
pub use mongo::{MongoDocumentStore, MongoStoreOptions};
pub use store::{
    CounterRecord, DocumentStore, KeyScope, MemoryDocumentStore, Mutation, UpsertOptions,
};
