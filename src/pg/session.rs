//! The native session contract.
//!
//! A [`Session`] is the protocol engine underneath one connection: it owns
//! the socket, the outbound and inbound buffers and the handshake, and it
//! never blocks. The connection state machine only ever talks to it through
//! this trait, which keeps the sequencing logic independent of the transport.

use std::collections::HashMap;

use super::error::{ErrorInfo, PgResult};
use super::protocol::TransactionStatus;
use super::types::Oid;
use crate::event::Notification;
use crate::event_loop::SocketHandle;

/// Callback the session invokes with the primary text of each server notice.
pub type NoticeHandler = Box<dyn FnMut(&str) + Send>;

/// Outcome of one handshake poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Wait until the socket is readable, then poll again.
    Reading,
    /// Wait until the socket is writable, then poll again.
    Writing,
    /// The handshake failed; see [`Session::error_message`].
    Failed,
    /// The session is ready for queries.
    Ok,
    /// Legacy status that carries no instruction.
    Active,
}

/// Coarse session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Socket created, connect in progress.
    Started,
    /// Connected, startup packet not yet fully sent.
    Made,
    /// Waiting for the server's authentication request.
    AwaitingResponse,
    /// Authenticated, waiting for the server to become ready.
    AuthOk,
    /// Ready for queries.
    Ok,
    /// Unusable.
    Bad,
}

/// Outcome of an attempt to write queued output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Nothing left to send.
    Done,
    /// The socket would block with bytes still queued.
    Pending,
    /// Writing failed; the session is unusable.
    Failed,
}

/// Status of one completed server result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The query string was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A command that returns rows completed.
    TuplesOk,
    /// The server started COPY TO STDOUT.
    CopyOut,
    /// The server started COPY FROM STDIN.
    CopyIn,
    /// The server's response was not understood.
    BadResponse,
    /// A notice or warning carried as a result.
    NonfatalError,
    /// The command failed.
    FatalError,
}

/// Descriptor of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

/// One completed result, as assembled from the server's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResult {
    pub status: ExecStatus,
    pub columns: Vec<Column>,
    /// Text-format cell values; `None` is SQL NULL.
    pub rows: Vec<Vec<Option<String>>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: Option<String>,
    /// Raw diagnostic fields of an error result, keyed by field code.
    pub error_fields: HashMap<u8, String>,
}

impl ServerResult {
    pub fn new(status: ExecStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error_fields: HashMap::new(),
        }
    }

    pub fn error(fields: HashMap<u8, String>) -> Self {
        Self {
            error_fields: fields,
            ..Self::new(ExecStatus::FatalError)
        }
    }

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    /// Structured form of `error_fields`.
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::from_fields(&self.error_fields)
    }
}

/// Allocates sessions and begins their non-blocking connect.
pub trait Connector {
    type Session: Session;

    /// Allocate a session for `conninfo` and start connecting.
    ///
    /// The returned session may still be mid-connect; the caller drives the
    /// rest of the handshake through [`Session::connect_poll`].
    fn start(&self, conninfo: &str) -> PgResult<Self::Session>;
}

/// A non-blocking protocol session.
///
/// Dropping a session releases it: the socket is closed and no callback
/// installed on it runs again.
pub trait Session {
    /// Put the session into non-blocking mode.
    fn set_nonblocking(&mut self) -> PgResult<()>;

    fn is_nonblocking(&self) -> bool;

    fn status(&self) -> ConnStatus;

    /// Socket to watch, or [`SocketHandle::INVALID`].
    fn socket(&self) -> SocketHandle;

    /// Advance the connection handshake by one step.
    fn connect_poll(&mut self) -> PollingStatus;

    /// The most recent failure, as human-readable text.
    fn error_message(&self) -> String;

    /// Install the notice callback, replacing any previous one.
    fn set_notice_handler(&mut self, handler: NoticeHandler);

    /// Queue a simple query. Fails without queueing anything if the session
    /// is not ready or the text cannot be sent.
    fn send_query(&mut self, text: &str) -> PgResult<()>;

    /// Queue a query with positional text parameters.
    fn send_query_params(&mut self, text: &str, params: &[String]) -> PgResult<()>;

    /// Write as much queued output as the socket accepts.
    fn flush(&mut self) -> FlushStatus;

    /// True while queued output is waiting for the socket.
    fn has_pending_output(&self) -> bool;

    /// Read everything the socket currently has and process it.
    fn consume_input(&mut self) -> PgResult<()>;

    /// True while the in-flight request has not been fully answered.
    fn is_busy(&self) -> bool;

    /// Take the next completed result, if any.
    fn next_result(&mut self) -> Option<ServerResult>;

    /// Take the next pending notification, if any.
    fn next_notification(&mut self) -> Option<Notification>;

    fn transaction_status(&self) -> TransactionStatus;

    /// A server parameter reported via ParameterStatus.
    fn parameter(&self, name: &str) -> Option<&str>;

    fn backend_pid(&self) -> i32;
}
