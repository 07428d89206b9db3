//! Mapping from caller-supplied logical keys to storage keys.

/// Prefix applied when none is configured.
///
/// Matches the wire format of other stores for the same middleware family, so
/// records written by this crate and by those stores are interchangeable.
pub const DEFAULT_PREFIX: &str = "mongo_rl_";

/// Deterministic codec from a logical client key to the persisted key.
///
/// The prefix namespaces this store's records inside a shared collection; it
/// is also what scopes bulk operations when local-keys mode is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Encode a logical key into its storage key: `prefix + key`.
    pub fn encode(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
