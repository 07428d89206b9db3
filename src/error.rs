//! Error type for store operations.

use crate::engine::Lifecycle;

/// Unified error for counter-store operations, generic over the backing
/// store's own error type.
///
/// `get` and `increment` propagate backend failures unwrapped via
/// [`StoreError::Backend`]; `decrement`, `reset_key` and `reset_all` wrap
/// them into operation-specific variants so the middleware can tell which
/// call failed from the message alone.
#[derive(Debug, thiserror::Error)]
pub enum StoreError<E> {
    /// An operation was issued outside the `Ready` lifecycle state.
    #[error("store is not ready to accept operations (state: {state:?})")]
    NotReady { state: Lifecycle },
    /// Backend failure, surfaced unmodified.
    #[error(transparent)]
    Backend(E),
    /// The atomic upsert behind `decrement` failed.
    #[error("failed to decrement key")]
    Decrement { source: E },
    /// The update behind `reset_key` failed.
    #[error("failed to reset key")]
    Reset { source: E },
    /// The bulk update behind `reset_all` failed.
    #[error("failed to reset all keys")]
    ResetAll { source: E },
    /// Releasing the backing connection failed.
    #[error("failed to close connection")]
    Close { source: E },
    /// The store returned no post-mutation document where one was required.
    #[error("store returned no document after an atomic upsert")]
    MissingPostImage,
}

impl<E: std::error::Error + 'static> StoreError<E> {
    /// Check if this error is a lifecycle rejection.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Borrow the backend error wherever one is carried.
    pub fn backend(&self) -> Option<&E> {
        match self {
            Self::Backend(e)
            | Self::Decrement { source: e }
            | Self::Reset { source: e }
            | Self::ResetAll { source: e }
            | Self::Close { source: e } => Some(e),
            Self::NotReady { .. } | Self::MissingPostImage => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct BackendError(&'static str);

    impl fmt::Display for BackendError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for BackendError {}

    #[test]
    fn not_ready_names_the_state() {
        let err: StoreError<BackendError> =
            StoreError::NotReady { state: Lifecycle::Uninitialized };
        let msg = err.to_string();
        assert!(msg.contains("not ready"));
        assert!(msg.contains("Uninitialized"));
        assert!(err.is_not_ready());
    }

    #[test]
    fn backend_variant_is_transparent() {
        let err: StoreError<BackendError> = StoreError::Backend(BackendError("socket reset"));
        assert_eq!(err.to_string(), "socket reset");
        assert_eq!(err.backend(), Some(&BackendError("socket reset")));
    }

    #[test]
    fn wrapped_variants_name_the_failed_operation() {
        let inner = BackendError("write refused");

        let dec: StoreError<BackendError> = StoreError::Decrement { source: inner.clone() };
        assert_eq!(dec.to_string(), "failed to decrement key");

        let reset: StoreError<BackendError> = StoreError::Reset { source: inner.clone() };
        assert_eq!(reset.to_string(), "failed to reset key");

        let all: StoreError<BackendError> = StoreError::ResetAll { source: inner };
        assert_eq!(all.to_string(), "failed to reset all keys");
    }

    #[test]
    fn wrapped_variants_keep_the_source_chain() {
        let err: StoreError<BackendError> =
            StoreError::Reset { source: BackendError("write refused") };
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "write refused");
    }

    #[test]
    fn missing_post_image_has_no_backend() {
        let err: StoreError<BackendError> = StoreError::MissingPostImage;
        assert!(err.backend().is_none());
        assert!(!err.is_not_ready());
    }
}
