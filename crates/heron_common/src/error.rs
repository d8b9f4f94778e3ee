use thiserror::Error;

use crate::types::TableId;

/// Convenience alias for `Result<T, EngineError>`.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure classification used by callers to decide between reporting,
/// retrying and escalating.
///
/// - `NonCritical` — expected application-level rejections (bad name, table
///   exists / missing); report to the requesting client.
/// - `Busy`        — someone else holds the resource; retry is reasonable.
/// - `Stale`       — the caller's cached schema view is outdated; refresh
///   and retry.
/// - `Critical`    — OS/storage faults and broken invariants; escalate,
///   never swallow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    NonCritical,
    Busy,
    Stale,
    Critical,
}

/// Error taxonomy of the engine core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Expected, recoverable condition: invalid table name, table already
    /// exists, table does not exist, rename target exists.
    #[error("{0}")]
    NonCritical(String),

    /// OS or storage-level fault; carries the underlying errno.
    #[error("{context}: {source}")]
    Critical {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Fatal state that has no underlying I/O error, e.g. a sequencer whose
    /// durable catalog and in-memory schema have diverged.
    #[error("{0}")]
    CriticalState(String),

    /// The table's entry in a pool is held by another owner. Carries the
    /// busy reason recorded by that owner.
    #[error("table busy [reason={0}]")]
    EntryUnavailable(String),

    /// A freshly opened reader no longer matches the caller's expected
    /// table identity or structure version. The stale handle has already
    /// been closed when this is raised.
    #[error(
        "reader out of date for {table}: expected id {expected_id} v{expected_version}, \
         got id {actual_id} v{actual_version}"
    )]
    ReaderOutOfDate {
        table: String,
        expected_id: TableId,
        expected_version: u64,
        actual_id: TableId,
        actual_version: u64,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn non_critical(msg: impl Into<String>) -> Self {
        EngineError::NonCritical(msg.into())
    }

    pub fn critical(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Critical {
            context: context.into(),
            source,
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        EngineError::EntryUnavailable(reason.into())
    }

    pub fn severity(&self) -> Severity {
        match self {
            EngineError::NonCritical(_) => Severity::NonCritical,
            EngineError::EntryUnavailable(_) => Severity::Busy,
            EngineError::ReaderOutOfDate { .. } => Severity::Stale,
            EngineError::Critical { .. }
            | EngineError::CriticalState(_)
            | EngineError::Serialization(_) => Severity::Critical,
        }
    }

    /// True when the caller may simply retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self.severity(), Severity::Busy)
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.severity(), Severity::Critical)
    }

    /// The underlying OS errno, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            EngineError::Critical { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
