use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    // Admission errors: the request is rejected before any engine-side
    // mutation, so no cleanup is required.
    #[error("product not found or inactive")]
    ProductUnavailable,
    #[error("session not found")]
    SessionNotFound,
    #[error("session is full")]
    SessionFull,
    #[error("session has expired")]
    SessionExpired,
    #[error("user already holds a participant slot in this session")]
    DuplicateJoin,
    #[error("only sessions without participants can be cancelled")]
    CancellationRejected,

    // Payment errors: abort the join before the participant row is written.
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("wallet ledger error: {0}")]
    Ledger(String),

    // Internal signal: the generated session code is already mapped. The
    // manager retries with a fresh code; callers never see this.
    #[error("session code already in use")]
    CodeCollision,

    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validation error: {0}")]
    Validation(String),

    // Programming-defect signals, never user-facing. Fail loudly.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// True for the typed rejections a joining caller can receive without any
    /// session state having been touched.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::ProductUnavailable
                | EngineError::SessionNotFound
                | EngineError::SessionFull
                | EngineError::SessionExpired
                | EngineError::DuplicateJoin
        )
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
