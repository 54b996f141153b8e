/// Infrastructure-level persistence failure with retry classification.
///
/// Domain-level contention (not found, lease conflicts, duplicate ids) is
/// reported through [`StoreError`] variants instead; this type only carries
/// unexpected failures of the storage layer itself. The retryable flag tells
/// callers whether repeating the whole operation can reasonably succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceError {
    /// Operation that failed (e.g., "save", "next_not_leased").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl PersistenceError {
    /// Transient failure: database busy/locked, connection loss, timeouts.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent failure: corruption, serialization errors, unexplained
    /// constraint violations, invalid queries.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Classify an sqlx error. SQLITE_BUSY and connection problems are
    /// retryable, constraint violations are permanent; anything unrecognized
    /// defaults to retryable (conservative).
    pub(crate) fn from_sqlx(operation: &str, e: sqlx::Error) -> Self {
        let message = e.to_string();

        if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            return Self::retryable(operation, format!("Database locked: {message}"));
        }
        if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
            return Self::permanent(operation, format!("Constraint violation: {message}"));
        }
        if message.contains("connection") || message.contains("timeout") {
            return Self::retryable(operation, format!("Connection error: {message}"));
        }

        Self::retryable(operation, message)
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for PersistenceError {}

/// Typed outcome of a store operation.
///
/// The first three variants are expected, recoverable-by-caller conditions
/// returned as values. `Fatal` is the distinct infrastructure category: the
/// surrounding transaction has rolled back, so callers retry the whole
/// operation rather than attempting partial recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(String),
    /// Lease conflict: someone else currently owns the record. Distinct from
    /// `NotFound` so callers can apply a different backoff policy.
    AlreadyLeased(String),
    Fatal(PersistenceError),
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists(message.into())
    }

    pub fn already_leased(message: impl Into<String>) -> Self {
        Self::AlreadyLeased(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::AlreadyLeased(msg) => write!(f, "already leased: {msg}"),
            Self::Fatal(e) => write!(f, "persistence failure: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for StoreError {
    fn from(e: PersistenceError) -> Self {
        Self::Fatal(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
