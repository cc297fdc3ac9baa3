//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;

use serde::Serialize;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Server returned an error.
    Server(Box<ErrorInfo>),

    /// Connection string could not be used.
    Config(String),

    /// Connection is closed or in invalid state.
    ConnectionClosed,

    /// Another command is already in progress on this session.
    Busy,
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server(info) => write!(f, "{}", info),
            PgError::Config(msg) => write!(f, "Invalid connection string: {}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::Busy => write!(f, "Another command is already in progress"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}

// ============================================================================
// Structured diagnostics
// ============================================================================

/// Diagnostic field codes of ErrorResponse / NoticeResponse messages.
/// Reference: https://www.postgresql.org/docs/current/protocol-error-fields.html
pub mod field {
    pub const SEVERITY: u8 = b'S';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// Server-reported diagnostic.
///
/// Every field is optional: a field the server did not send stays `None`,
/// which is distinct from a field sent with an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_query: Option<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

impl ErrorInfo {
    /// Build a diagnostic from raw ErrorResponse fields.
    ///
    /// Fields with codes outside the known set are ignored.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let get = |code: u8| fields.get(&code).cloned();
        Self {
            severity: get(field::SEVERITY),
            code: get(field::CODE),
            message: get(field::MESSAGE),
            detail: get(field::DETAIL),
            hint: get(field::HINT),
            position: get(field::POSITION),
            internal_position: get(field::INTERNAL_POSITION),
            internal_query: get(field::INTERNAL_QUERY),
            where_: get(field::WHERE),
            file: get(field::FILE),
            line: get(field::LINE),
            routine: get(field::ROUTINE),
        }
    }

    /// Number of populated fields.
    pub fn populated(&self) -> usize {
        [
            &self.severity,
            &self.code,
            &self.message,
            &self.detail,
            &self.hint,
            &self.position,
            &self.internal_position,
            &self.internal_query,
            &self.where_,
            &self.file,
            &self.line,
            &self.routine,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = self.severity.as_deref().unwrap_or("ERROR");
        let message = self.message.as_deref().unwrap_or("unknown server error");
        write!(f, "{}:  {}", severity, message)?;
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(ref d) = self.detail {
            write!(f, "\nDETAIL:  {}", d)?;
        }
        if let Some(ref h) = self.hint {
            write!(f, "\nHINT:  {}", h)?;
        }
        Ok(())
    }
}
