use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersistError>;

/// Error taxonomy of the persistence engine.
///
/// `Schema`, `Concurrency`, `Integrity`, `AddressResolution` and `Hook`
/// carry the operation-level failure modes; `Corruption` and
/// `InvalidArgument` cover store-level damage and caller mistakes.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("element has been modified: stored version is {stored}, captured version is {captured}")]
    Concurrency { stored: u64, captured: u64 },
    #[error("can't {action} element {element} with references [{}]", .blockers.join(", "))]
    Integrity {
        action: &'static str,
        element: String,
        blockers: Vec<String>,
    },
    #[error("unresolvable address: {0}")]
    AddressResolution(String),
    #[error("{hook} listener failed: {message}")]
    Hook {
        hook: &'static str,
        message: String,
    },
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl PersistError {
    /// True for the optimistic-concurrency failure a caller may retry
    /// after re-reading.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, PersistError::Concurrency { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, PersistError::Integrity { .. })
    }
}
