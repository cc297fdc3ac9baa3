//! Connection state machine.
//!
//! A [`Connection`] owns one session and decides, on every readiness
//! callback, what the session does next and which directions the reactor
//! watches. Nothing here blocks: an operation that cannot finish re-arms
//! interest and returns, and the next matching callback continues it.
//!
//! ```text
//! Disconnected --connect--> ConnectingWriting <--poll--> ConnectingReading
//!                                   |                          |
//!                                   +-------poll ok------------+--> Idle <--drain-- Busy
//!                                                                    |--send-------->^
//! any --end--> Closed
//! ```

use std::fmt;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::decoder::{self, DrainSummary};
use crate::dispatch::QueryRequest;
use crate::error::{ClientError, Result};
use crate::event::{ErrorEvent, Event, EventSink, EventStream};
use crate::event_loop::{IoWatcher, Reactor, Readiness};
use crate::notify;
use crate::pg::session::{ConnStatus, Connector, FlushStatus, PollingStatus, Session};
use crate::pg::TransactionStatus;

/// Position of a connection in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    ConnectingReading,
    ConnectingWriting,
    Idle,
    Busy,
    Closed,
}

impl Phase {
    pub fn is_connecting(self) -> bool {
        matches!(self, Phase::ConnectingReading | Phase::ConnectingWriting)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disconnected => "disconnected",
            Phase::ConnectingReading => "connecting (reading)",
            Phase::ConnectingWriting => "connecting (writing)",
            Phase::Idle => "idle",
            Phase::Busy => "busy",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One logical database session driven by reactor callbacks.
pub struct Connection<C: Connector, R: Reactor> {
    connector: C,
    watcher: IoWatcher<R>,
    session: Option<C::Session>,
    phase: Phase,
    sink: EventSink,
}

impl<C: Connector, R: Reactor> Connection<C, R> {
    /// Create a disconnected connection and the stream its events arrive on.
    pub fn new(connector: C, reactor: R) -> (Self, EventStream) {
        let (sink, stream) = EventSink::channel();
        let conn = Self {
            connector,
            watcher: IoWatcher::new(reactor),
            session: None,
            phase: Phase::Disconnected,
            sink,
        };
        (conn, stream)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn watcher(&self) -> &IoWatcher<R> {
        &self.watcher
    }

    pub fn reactor(&self) -> &R {
        self.watcher.reactor()
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        self.watcher.reactor_mut()
    }

    pub fn session(&self) -> Option<&C::Session> {
        self.session.as_ref()
    }

    /// A server parameter such as `server_version`, once connected.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.parameter(name))
    }

    pub fn backend_pid(&self) -> Option<i32> {
        self.session.as_ref().map(|s| s.backend_pid())
    }

    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.session.as_ref().map(|s| s.transaction_status())
    }

    /// Begin connecting. The outcome arrives later as a `connect` or
    /// `error` event; an `Err` here means no event will follow.
    pub fn connect(&mut self, conninfo: &str) -> Result<()> {
        if self.phase != Phase::Disconnected {
            return Err(ClientError::InvalidState {
                operation: "connect",
                phase: self.phase,
            });
        }
        if conninfo.trim().is_empty() {
            return Err(ClientError::ValidationError(
                "connection string must not be empty".to_string(),
            ));
        }

        let mut session = match self.connector.start(conninfo) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "connection couldn't be created");
                self.phase = Phase::Closed;
                return Err(ClientError::SetupError(e.to_string()));
            }
        };

        if let Err(e) = session.set_nonblocking() {
            warn!(error = %e, "unable to set connection to non-blocking");
            return Err(self.abandon(session, e.to_string()));
        }
        if session.status() == ConnStatus::Bad {
            warn!("bad connection status");
            let message = session.error_message();
            return Err(self.abandon(session, message));
        }
        let socket = session.socket();
        if !socket.is_valid() {
            warn!("socket descriptor is invalid");
            return Err(self.abandon(session, "socket descriptor is invalid".to_string()));
        }

        session.set_notice_handler(notify::notice_forwarder(&self.sink));
        self.session = Some(session);

        self.watcher.attach(socket);
        self.watcher.start_write();
        self.set_phase(Phase::ConnectingWriting);
        Ok(())
    }

    /// Send a plain-text query. Valid only while idle.
    pub fn send(&mut self, text: &str) -> Result<()> {
        let request = QueryRequest::simple(text)?;
        self.dispatch(&request)
    }

    /// Send a query with positional parameters. Valid only while idle.
    ///
    /// Every parameter must be a JSON string; anything else fails before
    /// any I/O.
    pub fn send_with_params(&mut self, text: &str, params: &[Value]) -> Result<()> {
        let request = QueryRequest::with_params(text, params)?;
        self.dispatch(&request)
    }

    /// Send a query with positional string parameters. Valid only while idle.
    pub fn send_with_text_params<S: AsRef<str>>(&mut self, text: &str, params: &[S]) -> Result<()> {
        let request = QueryRequest::with_text_params(text, params)?;
        self.dispatch(&request)
    }

    /// Send an already validated request. Valid only while idle.
    pub fn dispatch(&mut self, request: &QueryRequest) -> Result<()> {
        let session = match (self.phase, self.session.as_mut()) {
            (Phase::Idle, Some(session)) => session,
            (phase, _) => {
                return Err(ClientError::InvalidState {
                    operation: "send a query",
                    phase,
                })
            }
        };
        request.transmit(session, &mut self.watcher)?;
        self.set_phase(Phase::Busy);
        Ok(())
    }

    /// Create a named prepared statement.
    pub fn send_prepare(&mut self, _name: &str, _text: &str, _param_count: usize) -> Result<()> {
        Err(ClientError::NotImplemented("sendPrepare"))
    }

    /// Execute a named prepared statement.
    pub fn send_query_prepared(&mut self, _name: &str, _params: &[Value]) -> Result<()> {
        Err(ClientError::NotImplemented("sendQueryPrepared"))
    }

    /// Close the connection from any phase.
    ///
    /// Watchers are stopped before the session is released, and any partial
    /// result is discarded. Calling `end` on a closed connection does nothing.
    pub fn end(&mut self) {
        if self.phase == Phase::Closed {
            trace!("end on closed connection");
            return;
        }
        self.watcher.detach();
        if let Some(session) = self.session.take() {
            drop(session);
        }
        self.set_phase(Phase::Closed);
    }

    /// Readiness callback from the reactor.
    pub fn handle_io_event(&mut self, readiness: Readiness) {
        if readiness.is_error() {
            warn!(phase = %self.phase, "connection error reported by reactor");
            return;
        }
        if self.session.is_none() {
            trace!(phase = %self.phase, "readiness without a session");
            return;
        }

        if self.phase.is_connecting() {
            self.handle_connection_io();
            return;
        }

        if readiness.is_readable() {
            self.handle_readable();
        }
        if readiness.is_writable() {
            self.handle_writable();
        }
    }

    fn handle_connection_io(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let status = session.connect_poll();
        trace!(?status, "polled");

        match status {
            PollingStatus::Reading => {
                self.watcher.stop_write();
                self.watcher.start_read();
                self.set_phase(Phase::ConnectingReading);
            }
            PollingStatus::Writing => {
                self.watcher.stop_read();
                self.watcher.start_write();
                self.set_phase(Phase::ConnectingWriting);
            }
            PollingStatus::Failed => {
                let message = session.error_message();
                warn!(%message, "connection handshake failed");
                self.watcher.detach();
                self.session = None;
                self.set_phase(Phase::Closed);
                self.sink.emit(Event::Error(ErrorEvent::Message(message)));
            }
            PollingStatus::Ok => {
                self.watcher.stop_write();
                self.watcher.start_read();
                self.set_phase(Phase::Idle);
                self.sink.emit(Event::Connect);
            }
            PollingStatus::Active => {
                debug!("ignoring polling status without instruction");
            }
        }
    }

    fn handle_readable(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(e) = session.consume_input() {
            warn!(error = %e, phase = %self.phase, "failed to consume input");
            self.watcher.stop_read();
            self.sink
                .emit(Event::Error(ErrorEvent::Message(session.error_message())));
            return;
        }
        if session.has_pending_output() {
            // Replies queued while reading, such as a COPY refusal
            self.watcher.start_write();
        }

        if self.phase == Phase::Busy && !session.is_busy() {
            let summary: DrainSummary = decoder::drain_results(session, &self.sink);
            debug!(
                results = summary.results,
                rows = summary.rows,
                errors = summary.errors,
                "drained results"
            );
            self.set_phase(Phase::Idle);
            self.sink.emit(Event::ReadyForQuery);
        } else if self.phase == Phase::Busy {
            trace!("server still busy");
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        notify::drain_notifications(session, &self.sink);
    }

    fn handle_writable(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.flush() {
            FlushStatus::Done => self.watcher.stop_write(),
            FlushStatus::Pending => trace!("flush incomplete"),
            FlushStatus::Failed => {
                let message = session.error_message();
                warn!(%message, "flush failed");
                self.watcher.stop_write();
                self.sink.emit(Event::Error(ErrorEvent::Message(message)));
            }
        }
    }

    fn abandon(&mut self, session: C::Session, message: String) -> ClientError {
        drop(session);
        self.phase = Phase::Closed;
        ClientError::SetupError(message)
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "phase");
            self.phase = phase;
        }
    }
}

impl<C: Connector, R: Reactor> Drop for Connection<C, R> {
    fn drop(&mut self) {
        self.end();
    }
}

impl<C: Connector, R: Reactor> fmt::Debug for Connection<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .field("socket", &self.watcher.socket())
            .field("interest", &self.watcher.interest())
            .finish()
    }
}
