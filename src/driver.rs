//! Tokio reactor for a [`Connection`].
//!
//! [`TokioReactor`] owns the tokio registration of the socket the connection
//! watches and records the interest the connection asks for. On every turn
//! the driver waits for whichever readiness is currently wanted and hands the
//! result to [`Connection::handle_io_event`].

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest as TokioInterest;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, Phase};
use crate::decoder::ResultRow;
use crate::error::{ClientError, Result};
use crate::event::{ErrorEvent, Event, EventStream};
use crate::event_loop::{Direction, Interest, Reactor, Readiness, SocketHandle};
use crate::pg::session::Connector;
use crate::pg::wire::WireConnector;

/// Borrowed descriptor; the session owns and closes the socket.
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Reactor backed by tokio's I/O driver.
///
/// The socket is registered on the first `start` and deregistered on
/// `release`, which the connection issues before it closes the socket.
#[derive(Default)]
pub struct TokioReactor {
    fd: Option<AsyncFd<WatchedFd>>,
    interest: Interest,
    error: Option<io::Error>,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Whether a socket is registered with tokio.
    pub fn is_registered(&self) -> bool {
        self.fd.is_some()
    }

    /// The registration failure from the last `start`, if any.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    fn register(&mut self, socket: SocketHandle) -> io::Result<()> {
        let raw = socket.raw() as RawFd;
        if self.fd.as_ref().map(|fd| fd.get_ref().0) == Some(raw) {
            return Ok(());
        }
        self.fd = None;
        let fd = AsyncFd::with_interest(
            WatchedFd(raw),
            TokioInterest::READABLE | TokioInterest::WRITABLE,
        )?;
        debug!(fd = raw, "socket registered");
        self.fd = Some(fd);
        Ok(())
    }
}

impl Reactor for TokioReactor {
    fn start(&mut self, socket: SocketHandle, direction: Direction) {
        match self.register(socket) {
            Ok(()) => {
                self.interest = self.interest.add(match direction {
                    Direction::Read => Interest::READABLE,
                    Direction::Write => Interest::WRITABLE,
                })
            }
            Err(e) => {
                warn!(error = %e, "socket registration failed");
                self.error = Some(e);
            }
        }
    }

    fn stop(&mut self, _socket: SocketHandle, direction: Direction) {
        self.interest = self.interest.remove(match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        });
    }

    fn release(&mut self, socket: SocketHandle) {
        if self.fd.take().is_some() {
            debug!(fd = socket.raw(), "socket deregistered");
        }
        self.interest = Interest::NONE;
    }
}

/// A connection driven by the tokio runtime.
pub struct Driver<C: Connector = WireConnector> {
    conn: Connection<C, TokioReactor>,
    events: EventStream,
}

impl Driver<WireConnector> {
    /// Connect to `conninfo` and wait until the session is ready for queries.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let mut driver = Driver::new(WireConnector);
        driver.start(conninfo)?;
        driver.wait_connected().await?;
        Ok(driver)
    }
}

impl<C: Connector> Driver<C> {
    pub fn new(connector: C) -> Self {
        let (conn, events) = Connection::new(connector, TokioReactor::new());
        Self { conn, events }
    }

    pub fn connection(&self) -> &Connection<C, TokioReactor> {
        &self.conn
    }

    /// The connection, for sending queries.
    pub fn connection_mut(&mut self) -> &mut Connection<C, TokioReactor> {
        &mut self.conn
    }

    pub fn phase(&self) -> Phase {
        self.conn.phase()
    }

    /// Begin connecting without waiting for the outcome.
    pub fn start(&mut self, conninfo: &str) -> Result<()> {
        self.conn.connect(conninfo)?;
        if let Some(e) = self.conn.reactor_mut().take_error() {
            self.conn.end();
            return Err(ClientError::SetupError(e.to_string()));
        }
        Ok(())
    }

    /// Run until the `connect` event, failing with the handshake error instead.
    pub async fn wait_connected(&mut self) -> Result<()> {
        loop {
            match self.next_event().await? {
                Some(Event::Connect) => return Ok(()),
                Some(Event::Error(e)) => return Err(ClientError::HandshakeError(e.to_string())),
                Some(other) => trace!(kind = %other.kind(), "event before connect"),
                None => {
                    return Err(ClientError::HandshakeError(
                        "connection closed during handshake".to_string(),
                    ))
                }
            }
        }
    }

    /// Send `text` and collect its rows up to `readyForQuery`.
    ///
    /// Notices and notifications that arrive meanwhile are dropped; use
    /// [`next_event`](Self::next_event) to observe them.
    pub async fn query(&mut self, text: &str) -> Result<Vec<ResultRow>> {
        self.conn.send(text)?;
        self.collect_rows().await
    }

    /// Send `text` with string parameters and collect its rows up to `readyForQuery`.
    pub async fn query_with_params<S: AsRef<str>>(
        &mut self,
        text: &str,
        params: &[S],
    ) -> Result<Vec<ResultRow>> {
        self.conn.send_with_text_params(text, params)?;
        self.collect_rows().await
    }

    async fn collect_rows(&mut self) -> Result<Vec<ResultRow>> {
        let mut rows = Vec::new();
        let mut failure = None;
        loop {
            match self.next_event().await? {
                Some(Event::Row(row)) => rows.push(row),
                Some(Event::Error(e)) => {
                    // Keep the first one; the request still ends with readyForQuery.
                    failure.get_or_insert(e);
                }
                Some(Event::ReadyForQuery) => break,
                Some(other) => trace!(kind = %other.kind(), "event during query"),
                None => {
                    return Err(ClientError::TransmissionError(
                        crate::pg::PgError::ConnectionClosed,
                    ))
                }
            }
        }
        match failure {
            None => Ok(rows),
            Some(ErrorEvent::Server(info)) => Err(ClientError::ServerError(info)),
            Some(ErrorEvent::Message(message)) => Err(ClientError::TransmissionError(
                crate::pg::PgError::Io(io::Error::other(message)),
            )),
        }
    }

    /// The next event, turning the reactor until one is available.
    ///
    /// Returns `None` once nothing is queued and the connection has no interest
    /// left to wait on.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Ok(event) = self.events.try_recv() {
                return Ok(Some(event));
            }
            if !self.turn().await? {
                return Ok(self.events.try_recv().ok());
            }
        }
    }

    /// Wait for one readiness notification and dispatch it.
    ///
    /// Returns false without waiting when the connection watches nothing.
    pub async fn turn(&mut self) -> Result<bool> {
        if let Some(e) = self.conn.reactor_mut().take_error() {
            self.conn.end();
            return Err(ClientError::TransmissionError(e.into()));
        }

        let ready = {
            let reactor = self.conn.reactor();
            let interest = reactor.interest();
            let wanted = match (interest.is_readable(), interest.is_writable()) {
                (true, true) => TokioInterest::READABLE | TokioInterest::WRITABLE,
                (true, false) => TokioInterest::READABLE,
                (false, true) => TokioInterest::WRITABLE,
                (false, false) => return Ok(false),
            };
            let Some(fd) = reactor.fd.as_ref() else {
                return Ok(false);
            };

            let mut guard = fd
                .ready(wanted)
                .await
                .map_err(|e| ClientError::TransmissionError(e.into()))?;
            let ready = guard.ready();
            // Handlers drain the socket until it would block, so readiness
            // arriving from here on sets the flags again.
            guard.clear_ready();
            ready
        };

        let mut readiness = Readiness::default();
        if ready.is_readable() || ready.is_read_closed() {
            readiness = readiness | Readiness::READABLE;
        }
        if ready.is_writable() || ready.is_write_closed() {
            readiness = readiness | Readiness::WRITABLE;
        }
        trace!(?readiness, "ready");

        self.conn.handle_io_event(readiness);
        Ok(true)
    }

    /// Close the connection.
    pub fn end(&mut self) {
        self.conn.end();
    }
}

impl<C: Connector> Drop for Driver<C> {
    fn drop(&mut self) {
        self.end();
    }
}
