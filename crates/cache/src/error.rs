//! Cache error types

use std::sync::Arc;

use reader_scheduler::AbortError;
use thiserror::Error;

/// Errors surfaced by [`ResourceCache::acquire`](crate::ResourceCache::acquire)
///
/// Cloneable because one creation result fans out to every caller waiting
/// on the same key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The creation function failed; the entry was not retained
    #[error("resource creation failed: {0}")]
    Creation(Arc<anyhow::Error>),

    /// Work was cancelled through an abort signal
    #[error(transparent)]
    Aborted(#[from] AbortError),

    /// Every holder released the entry before its value arrived
    #[error("resource was released before it finished loading")]
    Released,
}

impl CacheError {
    /// Wrap an arbitrary creation failure
    pub fn creation(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Creation(Arc::new(err.into()))
    }

    /// Returns true for cancellations (hard abort or release-before-ready)
    ///
    /// Callers use this to suppress user-visible error reporting.
    pub fn is_abort(&self) -> bool {
        matches!(self, CacheError::Aborted(_) | CacheError::Released)
    }
}

/// Result alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
