use thiserror::Error;

use hearth_store::StoreError;

/// Errors from setting up a session. Operations on an open session never
/// fail this way; they report success as a `bool` instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("change subscription failed: {0}")]
    Subscribe(#[source] StoreError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
