//! Storage seam for counter records.
//!
//! [`DocumentStore`] is the capability interface the protocol engine requires
//! from a backing store: point lookup, one atomic find-and-upsert, one bulk
//! update, and a passive-expiry declaration. Anything that can provide those
//! four operations with document-level atomicity can sit behind the engine;
//! [`MemoryDocumentStore`] is the in-process implementation used in tests and
//! [`crate::mongo::MongoDocumentStore`] the production one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::clock::{Clock, SystemClock};

/// Name of the persisted window-expiry field, as it appears on the wire.
pub const RESET_TIME_FIELD: &str = "resetTime";

/// The sole persisted entity: one counter per storage key.
///
/// `total_hits` is signed — decrement has no floor and may push a counter
/// negative. `reset_time` is the instant after which the record is logically
/// expired and eligible for passive deletion by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    pub key: String,
    pub total_hits: i64,
    pub reset_time: SystemTime,
}

/// A mutation applied through [`DocumentStore::upsert_by_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Add `delta` to the hit count and move the window expiry to
    /// `reset_time`. When the key is absent and the upsert may create, the
    /// new record starts at `total_hits = delta`.
    Bump { delta: i64, reset_time: SystemTime },
    /// Zero the hit count without touching the window expiry. Never inserts,
    /// even when the upsert is allowed to create.
    Clear,
}

/// Options for a single-key upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// Create the record when the key is absent.
    pub create_if_absent: bool,
    /// Return the post-mutation record instead of `None`.
    pub return_post_image: bool,
}

/// Scope of a bulk update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    /// Every record in the collection.
    All,
    /// Only records whose storage key starts with the given prefix.
    Prefix(String),
}

impl KeyScope {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyScope::All => true,
            KeyScope::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Capability interface over a document store keyed by an opaque string.
///
/// `upsert_by_key` must be a single indivisible read-modify-write at the
/// storage engine: concurrent calls against the same key may commit in either
/// order but must never lose an update. The engine performs no locking or
/// retries of its own and relies entirely on that guarantee.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Error type surfaced by the backing store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish (or verify) connectivity. Called by the engine's `init`
    /// before it accepts traffic.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Release the backing connection; `force` skips graceful draining.
    async fn close(&self, force: bool) -> Result<(), Self::Error>;

    /// Point lookup; `None` when no live record exists for the key.
    async fn find_by_key(&self, key: &str) -> Result<Option<CounterRecord>, Self::Error>;

    /// Atomically mutate (and optionally create) the record for `key`,
    /// returning the post-mutation record when
    /// [`UpsertOptions::return_post_image`] is set and the record exists.
    async fn upsert_by_key(
        &self,
        key: &str,
        mutation: Mutation,
        options: UpsertOptions,
    ) -> Result<Option<CounterRecord>, Self::Error>;

    /// Apply `mutation` to every record in `scope`; returns how many records
    /// actually changed. May partially apply if the store aborts mid-sweep.
    async fn update_all_matching(
        &self,
        scope: KeyScope,
        mutation: Mutation,
    ) -> Result<u64, Self::Error>;

    /// Idempotently declare that records should be passively deleted `after`
    /// the timestamp in `field` passes; `Duration::ZERO` means "as soon as
    /// the timestamp itself has passed".
    async fn ensure_expiry_index(&self, field: &str, after: Duration) -> Result<(), Self::Error>;
}

struct MemoryInner {
    records: HashMap<String, CounterRecord>,
    expiry_enabled: bool,
}

/// In-process [`DocumentStore`] backed by a mutex-guarded map.
///
/// The mutex makes every upsert trivially atomic, so this store satisfies the
/// same contract as a real backend and the whole protocol can be exercised
/// without a network. Passive expiry is emulated lazily: once
/// `ensure_expiry_index` has been called, records whose `reset_time` has
/// passed are dropped on access.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<MemoryInner>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemoryDocumentStore")
            .field("records", &inner.records.len())
            .field("expiry_enabled", &inner.expiry_enabled)
            .finish()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Build a store that reads expiry time from `clock` instead of the
    /// system clock.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                records: HashMap::new(),
                expiry_enabled: false,
            })),
            clock: Arc::new(clock),
        }
    }

    /// Number of live records, expiring stale ones first. Test helper.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, inner: &mut MemoryInner) {
        if !inner.expiry_enabled {
            return;
        }
        let now = self.clock.now();
        inner.records.retain(|_, record| record.reset_time > now);
    }

    fn apply(record: &mut CounterRecord, mutation: Mutation) -> bool {
        match mutation {
            Mutation::Bump { delta, reset_time } => {
                record.total_hits += delta;
                record.reset_time = reset_time;
                true
            }
            Mutation::Clear => {
                let changed = record.total_hits != 0;
                record.total_hits = 0;
                changed
            }
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    type Error = std::convert::Infallible;

    async fn connect(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn close(&self, _force: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<CounterRecord>, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        Ok(inner.records.get(key).cloned())
    }

    async fn upsert_by_key(
        &self,
        key: &str,
        mutation: Mutation,
        options: UpsertOptions,
    ) -> Result<Option<CounterRecord>, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);

        let record = match inner.records.get_mut(key) {
            Some(record) => {
                Self::apply(record, mutation);
                record.clone()
            }
            None => {
                let record = match mutation {
                    Mutation::Bump { delta, reset_time } if options.create_if_absent => {
                        CounterRecord { key: key.to_string(), total_hits: delta, reset_time }
                    }
                    // Clear never materializes a record, matching the reset
                    // semantics: resetting an untouched key is a no-op.
                    _ => return Ok(None),
                };
                inner.records.insert(key.to_string(), record.clone());
                record
            }
        };

        Ok(options.return_post_image.then_some(record))
    }

    async fn update_all_matching(
        &self,
        scope: KeyScope,
        mutation: Mutation,
    ) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);

        let mut modified = 0;
        for (key, record) in inner.records.iter_mut() {
            if scope.matches(key) && Self::apply(record, mutation) {
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn ensure_expiry_index(
        &self,
        _field: &str,
        _after: Duration,
    ) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().expiry_enabled = true;
        Ok(())
    }
}
