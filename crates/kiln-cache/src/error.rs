pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache persistence helpers.
///
/// These never escape the public [`crate::BuildCache`] API; cache operations
/// log and degrade to misses/no-ops instead. The type exists so internal
/// helpers can use `?` and callers can decide what a failure means.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
