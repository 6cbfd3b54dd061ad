use std::fmt;

/// Main error type for the queue engine.
#[derive(Debug)]
pub enum Error {
    /// `enqueue` called with an `id` that already exists.
    DuplicateId(String),

    /// Malformed JSON, unknown config key, or an invalid `run_at`.
    BadInput(String),

    /// `dlq retry` / `requeue` against a row not in the required state.
    NotFound(String),

    /// I/O or lock contention the caller should retry after a short pause.
    TransientStoreError(String),

    /// The Executor failed to spawn a child process for a leased job.
    ExecutorStartError(String),

    /// Schema mismatch, or the database file is missing outside `init`.
    Fatal(String),

    /// Database errors not otherwise classified above.
    Database(sqlx::Error),

    /// Serialization errors (job wire format, row (de)serialization).
    Serialization(serde_json::Error),

    /// IO errors (log files, PID file).
    Io(std::io::Error),
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateId(id) => write!(f, "job '{}' already exists", id),
            Error::BadInput(msg) => write!(f, "bad input: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::TransientStoreError(msg) => write!(f, "transient store error: {}", msg),
            Error::ExecutorStartError(msg) => write!(f, "executor failed to start: {}", msg),
            Error::Fatal(msg) => write!(f, "fatal: {}", msg),
            Error::Database(e) => write!(f, "database error: {}", e),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Error::TransientStoreError(error.to_string())
            }
            _ => Error::Database(error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl Error {
    pub fn duplicate_id<T: Into<String>>(id: T) -> Self {
        Error::DuplicateId(id.into())
    }

    pub fn bad_input<T: Into<String>>(msg: T) -> Self {
        Error::BadInput(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn fatal<T: Into<String>>(msg: T) -> Self {
        Error::Fatal(msg.into())
    }

    /// Exit code the CLI should use when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::DuplicateId(_) | Error::BadInput(_) | Error::NotFound(_) => 2,
            Error::Fatal(_) => 1,
            _ => 1,
        }
    }
}
