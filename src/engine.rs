//! The counter-mutation protocol engine.
//!
//! [`CounterStore`] implements the fixed-window counter on top of any
//! [`DocumentStore`]: every mutating access applies one atomic conditional
//! upsert that creates the record if absent and rolls the window expiry
//! forward to `now + window`. The engine holds no per-key state or locks of
//! its own; correctness under concurrent hits rests entirely on the backing
//! store's single-document atomicity.

use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::key::KeyCodec;
use crate::store::{
    CounterRecord, DocumentStore, KeyScope, Mutation, UpsertOptions, RESET_TIME_FIELD,
};

/// Window length used when neither the builder nor `init` supplies one.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Lifecycle of the engine's shared backing connection.
///
/// Operations are accepted only in `Ready`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Connecting,
    Ready,
    Closed,
}

/// Hit count and window expiry for one client, as consumed by the
/// admission-control middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Hits recorded in the current window. Signed: decrement has no floor.
    pub total_hits: i64,
    /// Instant after which the record no longer counts toward the window.
    pub reset_time: SystemTime,
}

impl From<CounterRecord> for RateLimitInfo {
    fn from(record: CounterRecord) -> Self {
        Self { total_hits: record.total_hits, reset_time: record.reset_time }
    }
}

struct EngineState {
    lifecycle: Lifecycle,
    window: Duration,
}

/// Fixed-window counter store over a [`DocumentStore`] backend.
///
/// Construct via [`CounterStore::builder`], then call [`init`](Self::init)
/// before issuing operations:
///
/// ```rust
/// use rate_limit_mongo::{CounterStore, MemoryDocumentStore};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = CounterStore::builder(MemoryDocumentStore::new())
///     .prefix("rl:")
///     .build();
/// store.init(Duration::from_secs(60)).await.unwrap();
///
/// let info = store.increment("203.0.113.7").await.unwrap();
/// assert_eq!(info.total_hits, 1);
/// # }
/// ```
pub struct CounterStore<S, C = SystemClock> {
    store: S,
    codec: KeyCodec,
    clock: C,
    local_keys: bool,
    create_ttl_index: bool,
    state: RwLock<EngineState>,
}

impl<S: DocumentStore> CounterStore<S> {
    /// Start building a store over `backend` with the default clock.
    pub fn builder(backend: S) -> CounterStoreBuilder<S, SystemClock> {
        CounterStoreBuilder {
            store: backend,
            codec: KeyCodec::default(),
            clock: SystemClock,
            window: DEFAULT_WINDOW,
            local_keys: false,
            create_ttl_index: true,
        }
    }

    /// Store over `backend` with all defaults.
    pub fn new(backend: S) -> Self {
        Self::builder(backend).build()
    }
}

impl<S: DocumentStore, C: Clock> CounterStore<S, C> {
    /// Capture the window length, establish the backing connection, and (if
    /// configured) declare the passive-expiry index on the reset-time field.
    ///
    /// `window` overrides any value given at construction — the middleware
    /// supplies its own at startup. Holds the state lock for the whole
    /// transition, so operations racing an `init` queue behind it rather
    /// than hitting a half-connected backend. May be called again from
    /// `Ready` to re-run setup; fails once the store is closed.
    pub async fn init(&self, window: Duration) -> Result<(), StoreError<S::Error>> {
        let mut state = self.state.write().await;
        if state.lifecycle == Lifecycle::Closed {
            return Err(StoreError::NotReady { state: state.lifecycle });
        }

        state.lifecycle = Lifecycle::Connecting;
        state.window = window;

        let setup = async {
            self.store.connect().await?;
            if self.create_ttl_index {
                self.store.ensure_expiry_index(RESET_TIME_FIELD, Duration::ZERO).await?;
            }
            Ok(())
        };

        match setup.await {
            Ok(()) => {
                state.lifecycle = Lifecycle::Ready;
                tracing::info!(
                    window_ms = window.as_millis() as u64,
                    prefix = self.codec.prefix(),
                    ttl_index = self.create_ttl_index,
                    "counter store ready"
                );
                Ok(())
            }
            Err(e) => {
                state.lifecycle = Lifecycle::Uninitialized;
                Err(StoreError::Backend(e))
            }
        }
    }

    /// Release the backing connection. `force` skips graceful draining.
    ///
    /// Terminal for operations; calling `close` again is a no-op.
    pub async fn close(&self, force: bool) -> Result<(), StoreError<S::Error>> {
        let mut state = self.state.write().await;
        if state.lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        state.lifecycle = Lifecycle::Closed;
        drop(state);

        tracing::info!(force, "counter store closed");
        self.store.close(force).await.map_err(|e| StoreError::Close { source: e })
    }

    /// Read-only lookup; `None` for keys with no hits in the current window.
    pub async fn get(&self, key: &str) -> Result<Option<RateLimitInfo>, StoreError<S::Error>> {
        self.ready_window().await?;
        let record = self
            .store
            .find_by_key(&self.codec.encode(key))
            .await
            .map_err(StoreError::Backend)?;
        Ok(record.map(RateLimitInfo::from))
    }

    /// Record one hit for `key` and return the post-mutation count and
    /// window expiry.
    ///
    /// One atomic upsert: creates the record at `total_hits = 1` when
    /// absent, otherwise adds one; either way the window expiry moves to
    /// `now + window`. Concurrent increments on the same key serialize at
    /// the store, never in the engine.
    pub async fn increment(&self, key: &str) -> Result<RateLimitInfo, StoreError<S::Error>> {
        let record = self.bump(key, 1, StoreError::Backend).await?;
        record.map(RateLimitInfo::from).ok_or(StoreError::MissingPostImage)
    }

    /// Remove one hit for `key` (creating the record at `-1` when absent).
    ///
    /// No floor at zero: callers that roll back speculative hits can push a
    /// counter negative.
    pub async fn decrement(&self, key: &str) -> Result<(), StoreError<S::Error>> {
        self.bump(key, -1, |e| StoreError::Decrement { source: e }).await?;
        Ok(())
    }

    /// Zero the hit count for `key`, leaving the window expiry untouched.
    /// No effect (and no record created) when the key is absent.
    pub async fn reset_key(&self, key: &str) -> Result<(), StoreError<S::Error>> {
        self.ready_window().await?;
        self.store
            .upsert_by_key(&self.codec.encode(key), Mutation::Clear, UpsertOptions::default())
            .await
            .map_err(|e| StoreError::Reset { source: e })?;
        Ok(())
    }

    /// Zero every hit count — scoped to this store's prefix when
    /// `local_keys` is set, collection-wide otherwise.
    pub async fn reset_all(&self) -> Result<(), StoreError<S::Error>> {
        self.ready_window().await?;
        let scope = if self.local_keys {
            KeyScope::Prefix(self.codec.prefix().to_string())
        } else {
            KeyScope::All
        };
        let modified = self
            .store
            .update_all_matching(scope, Mutation::Clear)
            .await
            .map_err(|e| StoreError::ResetAll { source: e })?;
        tracing::debug!(modified, local_keys = self.local_keys, "reset all hit counts");
        Ok(())
    }

    /// Storage-key prefix in effect.
    pub fn prefix(&self) -> &str {
        self.codec.prefix()
    }

    /// Whether bulk operations are confined to this store's own keys.
    pub fn local_keys(&self) -> bool {
        self.local_keys
    }

    /// Window length in effect (the value captured at the last `init`).
    pub async fn window(&self) -> Duration {
        self.state.read().await.window
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.read().await.lifecycle
    }

    /// Shared shape of increment and decrement: one conditional atomic
    /// upsert. The readiness guard is only a gate; the upsert's own
    /// create-if-absent branch carries the correctness burden.
    async fn bump(
        &self,
        key: &str,
        delta: i64,
        wrap: impl FnOnce(S::Error) -> StoreError<S::Error>,
    ) -> Result<Option<CounterRecord>, StoreError<S::Error>> {
        let window = self.ready_window().await?;
        let reset_time = self.clock.now() + window;
        self.store
            .upsert_by_key(
                &self.codec.encode(key),
                Mutation::Bump { delta, reset_time },
                UpsertOptions { create_if_absent: true, return_post_image: true },
            )
            .await
            .map_err(wrap)
    }

    async fn ready_window(&self) -> Result<Duration, StoreError<S::Error>> {
        let state = self.state.read().await;
        match state.lifecycle {
            Lifecycle::Ready => Ok(state.window),
            other => Err(StoreError::NotReady { state: other }),
        }
    }
}

/// Builder for [`CounterStore`]. Obtained via [`CounterStore::builder`].
pub struct CounterStoreBuilder<S, C = SystemClock> {
    store: S,
    codec: KeyCodec,
    clock: C,
    window: Duration,
    local_keys: bool,
    create_ttl_index: bool,
}

impl<S: DocumentStore, C: Clock> CounterStoreBuilder<S, C> {
    /// Default window length, overridden by the value passed to `init`.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Storage-key prefix (default `mongo_rl_`).
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.codec = KeyCodec::new(prefix);
        self
    }

    /// Confine bulk operations to this store's own keys (default false).
    pub fn local_keys(mut self, local_keys: bool) -> Self {
        self.local_keys = local_keys;
        self
    }

    /// Declare a TTL index on the reset-time field at `init` (default true).
    pub fn create_ttl_index(mut self, create: bool) -> Self {
        self.create_ttl_index = create;
        self
    }

    /// Substitute the clock used for window arithmetic.
    pub fn clock<C2: Clock>(self, clock: C2) -> CounterStoreBuilder<S, C2> {
        CounterStoreBuilder {
            store: self.store,
            codec: self.codec,
            clock,
            window: self.window,
            local_keys: self.local_keys,
            create_ttl_index: self.create_ttl_index,
        }
    }

    pub fn build(self) -> CounterStore<S, C> {
        CounterStore {
            store: self.store,
            codec: self.codec,
            clock: self.clock,
            local_keys: self.local_keys,
            create_ttl_index: self.create_ttl_index,
            state: RwLock::new(EngineState {
                lifecycle: Lifecycle::Uninitialized,
                window: self.window,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryDocumentStore;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    async fn ready_store() -> CounterStore<MemoryDocumentStore, ManualClock> {
        let clock = ManualClock::new(at(1_000));
        let store = CounterStore::builder(MemoryDocumentStore::with_clock(clock.clone()))
            .clock(clock)
            .build();
        store.init(Duration::from_secs(30)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn operations_before_init_are_refused() {
        let store = CounterStore::new(MemoryDocumentStore::new());

        let err = store.increment("k").await.unwrap_err();
        assert!(err.is_not_ready());
        assert!(store.get("k").await.unwrap_err().is_not_ready());
        assert!(store.decrement("k").await.unwrap_err().is_not_ready());
        assert!(store.reset_key("k").await.unwrap_err().is_not_ready());
        assert!(store.reset_all().await.unwrap_err().is_not_ready());
    }

    #[tokio::test]
    async fn init_overrides_builder_window_and_reaches_ready() {
        let store = CounterStore::builder(MemoryDocumentStore::new())
            .window(Duration::from_secs(5))
            .build();
        assert_eq!(store.lifecycle().await, Lifecycle::Uninitialized);

        store.init(Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.lifecycle().await, Lifecycle::Ready);
        assert_eq!(store.window().await, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn increment_creates_then_counts_up() {
        let store = ready_store().await;

        let first = store.increment("client").await.unwrap();
        assert_eq!(first.total_hits, 1);
        assert_eq!(first.reset_time, at(1_030));

        let second = store.increment("client").await.unwrap();
        assert_eq!(second.total_hits, 2);
    }

    #[tokio::test]
    async fn mutating_hits_roll_the_window_forward() {
        let clock = ManualClock::new(at(1_000));
        let store = CounterStore::builder(MemoryDocumentStore::with_clock(clock.clone()))
            .clock(clock.clone())
            .build();
        store.init(Duration::from_secs(30)).await.unwrap();

        store.increment("client").await.unwrap();
        clock.advance(Duration::from_secs(10));
        let info = store.increment("client").await.unwrap();

        // Window measured from the most recent hit, not the first.
        assert_eq!(info.reset_time, at(1_040));
    }

    #[tokio::test]
    async fn decrement_has_no_floor() {
        let store = ready_store().await;

        store.decrement("client").await.unwrap();
        assert_eq!(store.get("client").await.unwrap().unwrap().total_hits, -1);

        store.decrement("client").await.unwrap();
        assert_eq!(store.get("client").await.unwrap().unwrap().total_hits, -2);
    }

    #[tokio::test]
    async fn reset_key_is_idempotent_and_keeps_expiry() {
        let store = ready_store().await;
        store.increment("client").await.unwrap();
        let before = store.get("client").await.unwrap().unwrap();

        store.reset_key("client").await.unwrap();
        let after = store.get("client").await.unwrap().unwrap();
        assert_eq!(after.total_hits, 0);
        assert_eq!(after.reset_time, before.reset_time);

        store.reset_key("client").await.unwrap();
        assert_eq!(store.get("client").await.unwrap().unwrap().total_hits, 0);
    }

    #[tokio::test]
    async fn reset_key_on_absent_key_creates_nothing() {
        let store = ready_store().await;
        store.reset_key("ghost").await.unwrap();
        assert_eq!(store.get("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_are_stored_under_the_prefix() {
        let backend = MemoryDocumentStore::new();
        let store = CounterStore::builder(backend.clone()).prefix("api:").build();
        store.init(Duration::from_secs(30)).await.unwrap();

        store.increment("user-1").await.unwrap();
        assert!(backend.find_by_key("api:user-1").await.unwrap().is_some());
        assert_eq!(store.prefix(), "api:");
    }

    #[tokio::test]
    async fn close_is_terminal_for_operations_but_idempotent() {
        let store = ready_store().await;
        store.close(false).await.unwrap();

        assert_eq!(store.lifecycle().await, Lifecycle::Closed);
        assert!(store.increment("k").await.unwrap_err().is_not_ready());
        assert!(store.init(Duration::from_secs(30)).await.unwrap_err().is_not_ready());
        store.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn init_can_rerun_from_ready() {
        let store = ready_store().await;
        store.init(Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.window().await, Duration::from_secs(60));
        assert_eq!(store.lifecycle().await, Lifecycle::Ready);
    }

    #[tokio::test]
    async fn ttl_index_declaration_can_be_disabled() {
        let clock = ManualClock::new(at(0));
        let backend = MemoryDocumentStore::with_clock(clock.clone());
        let store = CounterStore::builder(backend.clone())
            .create_ttl_index(false)
            .clock(clock.clone())
            .build();
        store.init(Duration::from_secs(30)).await.unwrap();

        store.increment("client").await.unwrap();
        clock.advance(Duration::from_secs(3600));
        // No expiry index declared, so the stale record lingers.
        assert!(store.get("client").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_keys_flag_is_introspectable() {
        let store = CounterStore::builder(MemoryDocumentStore::new()).local_keys(true).build();
        assert!(store.local_keys());
        assert!(!CounterStore::new(MemoryDocumentStore::new()).local_keys());
    }
}
