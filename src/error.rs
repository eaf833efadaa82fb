//! Error types for lite_trickle.
//!
//! All errors that can occur within the engine are represented by
//! [`LiteTrickleError`]. Errors are propagated via `Result<T, LiteTrickleError>`
//! throughout the codebase and surfaced to the host at the pipeline boundary.
//!
//! # Error Classification
//!
//! Errors are classified into five categories that determine how the host
//! should react:
//! - **User** — invalid queries, unknown tables/columns, bad arguments.
//! - **Value** — SQLite integer overflow, non-finite numbers, JSON parse
//!   failures. Fatal to the current fetch; they name the offending
//!   `table.column`.
//! - **Protocol** — malformed sync messages, version mismatches, push
//!   endpoint failures. Fatal through the connection manager.
//! - **System** — SQLite failures, cooperative cancellation.
//! - **Internal** — bugs. Should not happen.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum LiteTrickleError {
    // ── User errors ──────────────────────────────────────────────────────
    /// The query AST could not be validated against the client schema.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced table is not part of the client schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A row or condition referenced a column the schema does not declare.
    #[error("unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    // ── Value / serialization errors ─────────────────────────────────────
    /// A SQLite integer does not fit double precision without loss.
    #[error("integer out of range for {table}.{column}: {value}")]
    IntegerOutOfRange {
        table: String,
        column: String,
        value: i64,
    },

    /// A SQLite REAL was NaN or infinite.
    #[error("non-finite number for {table}.{column}")]
    NonFiniteNumber { table: String, column: String },

    /// A JSON column failed to parse.
    #[error("malformed JSON in {table}.{column}: {reason}")]
    JsonParse {
        table: String,
        column: String,
        reason: String,
    },

    // ── Constraint errors ────────────────────────────────────────────────
    /// A pushed `add` collided with an existing primary key.
    #[error("uniqueness violation on {table}: {key}")]
    UniquenessViolation { table: String, key: String },

    /// A pushed `remove`/`edit` referenced a row that does not exist.
    #[error("row not present in {table}: {key}")]
    RowNotFound { table: String, key: String },

    // ── Protocol errors ──────────────────────────────────────────────────
    /// A typed error decoded from (or raised about) the sync protocol.
    #[error("{0}")]
    Protocol(ProtocolError),

    // ── System errors ────────────────────────────────────────────────────
    /// An underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The cooperative time-slice budget was exhausted.
    #[error("pipeline cancelled: {0}")]
    Cancelled(String),

    // ── Planner errors ───────────────────────────────────────────────────
    /// No plan attempt satisfied the mandatory constraints.
    #[error("no viable plan: {0}")]
    PlanningFailed(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of error severity/kind for hosts and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Value,
    Protocol,
    System,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::User => write!(f, "USER"),
            ErrorKind::Value => write!(f, "VALUE"),
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
            ErrorKind::System => write!(f, "SYSTEM"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl LiteTrickleError {
    /// Classify the error for monitoring and host dispatch.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LiteTrickleError::InvalidQuery(_)
            | LiteTrickleError::InvalidArgument(_)
            | LiteTrickleError::UnknownTable(_)
            | LiteTrickleError::UnknownColumn { .. }
            | LiteTrickleError::PlanningFailed(_) => ErrorKind::User,

            LiteTrickleError::IntegerOutOfRange { .. }
            | LiteTrickleError::NonFiniteNumber { .. }
            | LiteTrickleError::JsonParse { .. }
            | LiteTrickleError::UniquenessViolation { .. }
            | LiteTrickleError::RowNotFound { .. } => ErrorKind::Value,

            LiteTrickleError::Protocol(_) => ErrorKind::Protocol,

            LiteTrickleError::Sqlite(_) | LiteTrickleError::Cancelled(_) => ErrorKind::System,

            LiteTrickleError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error terminates the whole pipeline, as opposed to a
    /// single fetch or mutation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiteTrickleError::Protocol(_)
                | LiteTrickleError::Sqlite(_)
                | LiteTrickleError::Internal(_)
        )
    }
}

// ── Protocol error ─────────────────────────────────────────────────────────

/// A structured error surfaced from the sync protocol.
///
/// Covers transport-level push failures (`unsupportedPushVersion`,
/// `unsupportedSchemaVersion`, `http`, `zeroPusher`), server error frames,
/// and locally detected sequencing violations (e.g. mismatched poke IDs).
/// Unknown wire codes are preserved verbatim in `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolError {
    /// The wire code, preserved verbatim even when unrecognised.
    pub kind: String,
    /// Where the error originated: `"server"` or `"client"`.
    pub origin: String,
    /// Short machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional structured payload from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Mutation IDs affected by the failure, when the server names them.
    #[serde(
        default,
        rename = "mutationIDs",
        skip_serializing_if = "Option::is_none"
    )]
    pub mutation_ids: Option<Vec<u64>>,
}

impl ProtocolError {
    /// A client-detected protocol violation.
    pub fn client(kind: &str, reason: &str) -> Self {
        ProtocolError {
            kind: kind.to_string(),
            origin: "client".to_string(),
            reason: reason.to_string(),
            message: None,
            details: None,
            mutation_ids: None,
        }
    }

    /// A server-reported protocol failure.
    pub fn server(kind: &str, reason: &str) -> Self {
        ProtocolError {
            kind: kind.to_string(),
            origin: "server".to_string(),
            reason: reason.to_string(),
            message: None,
            details: None,
            mutation_ids: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol error [{}/{}]: {}",
            self.origin, self.kind, self.reason
        )?;
        if let Some(msg) = &self.message {
            write!(f, " ({msg})")?;
        }
        Ok(())
    }
}

impl From<ProtocolError> for LiteTrickleError {
    fn from(e: ProtocolError) -> Self {
        LiteTrickleError::Protocol(e)
    }
}
