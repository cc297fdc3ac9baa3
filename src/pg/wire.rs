//! Non-blocking PostgreSQL session over a raw socket.
//!
//! This module provides the session the engine runs on in production:
//! - Non-blocking TCP or unix-domain connect, trying each resolved address
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256) as a poll loop
//! - Simple and parameterized (text format) queries
//! - Incremental result assembly from partial reads

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;

use bytes::{Buf, BytesMut};
use socket2::{Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use super::config::{ConnInfo, Target};
use super::error::{field, ErrorInfo, PgError, PgResult};
use super::protocol::*;
use super::scram::{self, ScramExchange};
use super::session::{
    Column, ConnStatus, Connector, ExecStatus, FlushStatus, NoticeHandler, PollingStatus,
    ServerResult, Session,
};
use super::types::Format;
use crate::event::Notification;
use crate::event_loop::SocketHandle;

const READ_CHUNK: usize = 8192;

/// Starts [`WireSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireConnector;

impl Connector for WireConnector {
    type Session = WireSession;

    fn start(&self, conninfo: &str) -> PgResult<WireSession> {
        let info = ConnInfo::parse(conninfo)?;
        Ok(WireSession::start(info))
    }
}

/// Where the handshake is.
enum Stage {
    /// Socket connect in progress
    Connecting,
    /// Startup packet queued
    Startup,
    /// Waiting for an authentication request or result
    Authenticating,
    /// SCRAM exchange in progress
    Sasl(ScramExchange),
    /// Authenticated; collecting parameters until ReadyForQuery
    AwaitingReady,
    Ready,
    Failed,
}

/// A session speaking protocol 3.0 over a non-blocking socket.
pub struct WireSession {
    info: ConnInfo,
    socket: Option<Socket>,
    /// Addresses not yet tried
    candidates: VecDeque<SockAddr>,
    stage: Stage,
    status: ConnStatus,
    nonblocking: bool,
    out_buf: BytesMut,
    in_buf: BytesMut,
    last_error: String,
    notice_handler: Option<NoticeHandler>,
    /// A request has been queued and its ReadyForQuery has not arrived
    in_flight: bool,
    /// Tuples result being filled by DataRow messages
    current: Option<ServerResult>,
    completed: VecDeque<ServerResult>,
    notifications: VecDeque<Notification>,
    parameters: HashMap<String, String>,
    backend_pid: i32,
    backend_secret_key: i32,
    transaction_status: TransactionStatus,
}

impl WireSession {
    /// Allocate a session and begin connecting to the first address of `info`.
    ///
    /// Immediate failures (unresolvable host, refused connect on every
    /// address) leave the session in [`ConnStatus::Bad`].
    pub fn start(info: ConnInfo) -> Self {
        let mut session = Self {
            info,
            socket: None,
            candidates: VecDeque::new(),
            stage: Stage::Connecting,
            status: ConnStatus::Started,
            nonblocking: false,
            out_buf: BytesMut::with_capacity(READ_CHUNK),
            in_buf: BytesMut::with_capacity(32768),
            last_error: String::new(),
            notice_handler: None,
            in_flight: false,
            current: None,
            completed: VecDeque::new(),
            notifications: VecDeque::new(),
            parameters: HashMap::new(),
            backend_pid: 0,
            backend_secret_key: 0,
            transaction_status: TransactionStatus::Idle,
        };

        match resolve(&session.info.target()) {
            Ok(addrs) => {
                session.candidates = addrs.into();
                if let Err(e) = session.connect_next() {
                    session.fail(e);
                }
            }
            Err(e) => session.fail(e),
        }
        session
    }

    pub fn conninfo(&self) -> &ConnInfo {
        &self.info
    }

    pub fn backend_secret_key(&self) -> i32 {
        self.backend_secret_key
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Start connecting to the next candidate address.
    ///
    /// Addresses that refuse immediately are skipped.
    fn connect_next(&mut self) -> Result<(), String> {
        let mut last = String::from("no addresses to connect to");
        while let Some(addr) = self.candidates.pop_front() {
            match open_socket(&addr) {
                Ok((socket, connected)) => {
                    self.socket = Some(socket);
                    self.stage = Stage::Connecting;
                    self.status = ConnStatus::Started;
                    if connected {
                        self.queue_startup();
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "connect attempt failed");
                    last = describe_connect_error(&self.info, &e);
                }
            }
        }
        Err(last)
    }

    fn queue_startup(&mut self) {
        let startup = StartupMessage {
            user: self.info.user.clone(),
            database: Some(self.info.dbname.clone()),
            options: self.info.startup_options(),
        };
        startup.encode_into(&mut self.out_buf);
        self.stage = Stage::Startup;
        self.status = ConnStatus::Made;
    }

    /// Whether the in-progress socket connect has finished.
    fn connect_finished(&self) -> io::Result<bool> {
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        if let Some(err) = socket.take_error()? {
            return Err(err);
        }
        match socket.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fail(&mut self, message: String) {
        debug!(%message, "session failed");
        self.last_error = message;
        self.stage = Stage::Failed;
        self.status = ConnStatus::Bad;
        self.in_flight = false;
        self.current = None;
    }

    fn poll_handshake(&mut self) -> Result<PollingStatus, String> {
        loop {
            match self.stage {
                Stage::Failed => return Ok(PollingStatus::Failed),
                Stage::Ready => return Ok(PollingStatus::Ok),
                Stage::Connecting => match self.connect_finished() {
                    Ok(true) => self.queue_startup(),
                    Ok(false) => return Ok(PollingStatus::Writing),
                    // The watched socket must not change under the caller, so a
                    // connect that fails after starting is final.
                    Err(e) => return Err(describe_connect_error(&self.info, &e)),
                },
                _ => {}
            }

            if !self.write_out().map_err(|e| io_message("could not send data to server", &e))? {
                return Ok(PollingStatus::Writing);
            }
            if matches!(self.stage, Stage::Startup) {
                self.stage = Stage::Authenticating;
                self.status = ConnStatus::AwaitingResponse;
            }

            let eof = self
                .read_in()
                .map_err(|e| io_message("could not receive data from server", &e))?;

            while let Some(msg) = next_message(&mut self.in_buf).map_err(|e| e.to_string())? {
                self.handle_startup_message(msg)?;
            }

            if matches!(self.stage, Stage::Ready) && self.out_buf.is_empty() {
                return Ok(PollingStatus::Ok);
            }
            if eof {
                return Err("server closed the connection unexpectedly".to_string());
            }
            if self.out_buf.is_empty() {
                return Ok(PollingStatus::Reading);
            }
        }
    }

    fn handle_startup_message(&mut self, msg: BackendMessage) -> Result<(), String> {
        match msg {
            BackendMessage::AuthenticationOk => {
                if let Stage::Sasl(ref exchange) = self.stage {
                    if !exchange.is_done() {
                        return Err(PgError::Auth(
                            "server did not complete SCRAM authentication".to_string(),
                        )
                        .to_string());
                    }
                }
                self.stage = Stage::AwaitingReady;
                self.status = ConnStatus::AuthOk;
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?.to_string();
                PasswordMessage { password }.encode_into(&mut self.out_buf);
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let hash = scram::md5_password(&self.info.user, self.password()?, &salt);
                PasswordMessage { password: hash }.encode_into(&mut self.out_buf);
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(format!(
                        "none of the server's SASL authentication mechanisms are supported: {}",
                        mechanisms.join(", ")
                    ));
                }
                let (exchange, first) = ScramExchange::start(self.password()?);
                SaslInitialResponseMessage {
                    mechanism: scram::MECHANISM,
                    data: &first,
                }
                .encode_into(&mut self.out_buf);
                self.stage = Stage::Sasl(exchange);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let Stage::Sasl(ref mut exchange) = self.stage else {
                    return Err("unexpected SASL challenge".to_string());
                };
                let response = exchange
                    .server_first(&data)
                    .map_err(|e| PgError::Auth(e.to_string()).to_string())?;
                SaslResponseMessage { data: &response }.encode_into(&mut self.out_buf);
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let Stage::Sasl(ref mut exchange) = self.stage else {
                    return Err("unexpected SASL final message".to_string());
                };
                exchange
                    .server_final(&data)
                    .map_err(|e| PgError::Auth(e.to_string()).to_string())?;
            }
            BackendMessage::AuthenticationUnsupported { code } => {
                return Err(format!("authentication method {} not supported", code));
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_pid = process_id;
                self.backend_secret_key = secret_key;
            }
            BackendMessage::NoticeResponse { fields } => self.notice(&fields),
            BackendMessage::NegotiateProtocolVersion {
                minor_version,
                unrecognized,
            } => {
                warn!(
                    minor_version,
                    ?unrecognized,
                    "server negotiated protocol version down"
                );
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(ErrorInfo::from_fields(&fields).to_string());
            }
            BackendMessage::ReadyForQuery { status } => {
                if !matches!(self.stage, Stage::AwaitingReady) {
                    return Err(
                        "server sent ReadyForQuery before authentication completed".to_string()
                    );
                }
                self.transaction_status = status;
                self.stage = Stage::Ready;
                self.status = ConnStatus::Ok;
            }
            other => {
                trace!(message = ?other, "ignored during startup");
            }
        }
        Ok(())
    }

    fn password(&self) -> Result<&str, String> {
        self.info
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("password required".to_string()).to_string())
    }

    // ========================================================================
    // Steady state
    // ========================================================================

    fn ensure_ready(&self) -> PgResult<()> {
        if self.status != ConnStatus::Ok {
            return Err(PgError::ConnectionClosed);
        }
        if self.in_flight {
            return Err(PgError::Busy);
        }
        Ok(())
    }

    fn begin_request(&mut self) {
        self.in_flight = true;
        self.current = None;
        self.completed.clear();
    }

    fn handle_message(&mut self, msg: BackendMessage) {
        match msg {
            BackendMessage::RowDescription { fields } => {
                let mut result = ServerResult::new(ExecStatus::TuplesOk);
                result.columns = fields
                    .into_iter()
                    .map(|f| Column {
                        name: f.name,
                        type_oid: f.type_oid,
                    })
                    .collect();
                self.current = Some(result);
            }
            BackendMessage::DataRow { values } => match self.current.as_mut() {
                Some(result) => result.rows.push(
                    values
                        .into_iter()
                        .map(|v| v.map(|data| String::from_utf8_lossy(&data).into_owned()))
                        .collect(),
                ),
                None => warn!("data row without row description"),
            },
            BackendMessage::CommandComplete { tag } => {
                let mut result = self
                    .current
                    .take()
                    .unwrap_or_else(|| ServerResult::new(ExecStatus::CommandOk));
                result.command_tag = Some(tag);
                self.completed.push_back(result);
            }
            BackendMessage::EmptyQueryResponse => {
                self.completed
                    .push_back(ServerResult::new(ExecStatus::EmptyQuery));
            }
            BackendMessage::ErrorResponse { fields } => {
                self.current = None;
                if self.in_flight {
                    self.completed.push_back(ServerResult::error(fields));
                } else {
                    // Unsolicited, e.g. an administrator shutdown
                    let info = ErrorInfo::from_fields(&fields);
                    warn!(%info, "error outside of a request");
                    self.last_error = info.to_string();
                }
            }
            BackendMessage::CopyInResponse => {
                CopyFailMessage {
                    reason: "COPY FROM STDIN is not supported by this client",
                }
                .encode_into(&mut self.out_buf);
                self.completed.push_back(ServerResult::new(ExecStatus::CopyIn));
            }
            BackendMessage::CopyOutResponse => {
                self.completed
                    .push_back(ServerResult::new(ExecStatus::CopyOut));
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.in_flight = false;
            }
            BackendMessage::NoticeResponse { fields } => self.notice(&fields),
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.notifications.push_back(Notification {
                    channel,
                    payload,
                    process_id,
                });
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            other => {
                trace!(message = ?other, "ignored");
            }
        }
    }

    fn notice(&mut self, fields: &HashMap<u8, String>) {
        let message = fields.get(&field::MESSAGE).map(String::as_str).unwrap_or("");
        match self.notice_handler.as_mut() {
            Some(handler) => handler(message),
            None => debug!(message, "notice without handler"),
        }
    }

    // ========================================================================
    // Socket I/O
    // ========================================================================

    /// Write queued output until done or the socket would block.
    /// Returns true once everything is written.
    fn write_out(&mut self) -> io::Result<bool> {
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        while !self.out_buf.is_empty() {
            match (&*socket).write(&self.out_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.out_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read until the socket would block. Returns true on end of stream.
    fn read_in(&mut self) -> io::Result<bool> {
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match (&*socket).read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.in_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Session for WireSession {
    fn set_nonblocking(&mut self) -> PgResult<()> {
        if let Some(ref socket) = self.socket {
            socket.set_nonblocking(true)?;
        }
        self.nonblocking = true;
        Ok(())
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    fn status(&self) -> ConnStatus {
        self.status
    }

    fn socket(&self) -> SocketHandle {
        self.socket.as_ref().map_or(SocketHandle::INVALID, raw_handle)
    }

    fn connect_poll(&mut self) -> PollingStatus {
        match self.poll_handshake() {
            Ok(status) => status,
            Err(message) => {
                self.fail(message);
                PollingStatus::Failed
            }
        }
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    fn set_notice_handler(&mut self, handler: NoticeHandler) {
        self.notice_handler = Some(handler);
    }

    fn send_query(&mut self, text: &str) -> PgResult<()> {
        self.ensure_ready()?;
        if text.contains('\0') {
            return Err(PgError::Protocol("query text contains a NUL byte".into()));
        }
        QueryMessage { query: text }.encode_into(&mut self.out_buf);
        self.begin_request();
        Ok(())
    }

    fn send_query_params(&mut self, text: &str, params: &[String]) -> PgResult<()> {
        self.ensure_ready()?;
        if params.len() > u16::MAX as usize {
            return Err(PgError::Protocol(format!(
                "number of parameters must be between 0 and {}",
                u16::MAX
            )));
        }
        if text.contains('\0') || params.iter().any(|p| p.contains('\0')) {
            return Err(PgError::Protocol("query contains a NUL byte".into()));
        }

        let values: Vec<Option<&str>> = params.iter().map(|p| Some(p.as_str())).collect();
        ParseMessage {
            name: "",
            query: text,
            param_types: &[],
        }
        .encode_into(&mut self.out_buf);
        BindMessage {
            portal: "",
            statement: "",
            params: &values,
            result_format: Format::Text,
        }
        .encode_into(&mut self.out_buf);
        DescribeMessage {
            kind: b'P',
            name: "",
        }
        .encode_into(&mut self.out_buf);
        ExecuteMessage {
            portal: "",
            max_rows: 0,
        }
        .encode_into(&mut self.out_buf);
        SyncMessage.encode_into(&mut self.out_buf);
        self.begin_request();
        Ok(())
    }

    fn flush(&mut self) -> FlushStatus {
        if self.status == ConnStatus::Bad {
            return FlushStatus::Failed;
        }
        match self.write_out() {
            Ok(true) => FlushStatus::Done,
            Ok(false) => FlushStatus::Pending,
            Err(e) => {
                self.fail(io_message("could not send data to server", &e));
                FlushStatus::Failed
            }
        }
    }

    fn has_pending_output(&self) -> bool {
        !self.out_buf.is_empty()
    }

    fn consume_input(&mut self) -> PgResult<()> {
        if self.status == ConnStatus::Bad {
            return Err(PgError::ConnectionClosed);
        }

        let eof = match self.read_in() {
            Ok(eof) => eof,
            Err(e) => {
                self.fail(io_message("could not receive data from server", &e));
                return Err(PgError::Io(e));
            }
        };

        loop {
            match next_message(&mut self.in_buf) {
                Ok(Some(msg)) => self.handle_message(msg),
                Ok(None) => break,
                Err(e) => {
                    self.fail(e.to_string());
                    return Err(e);
                }
            }
        }

        if eof {
            self.fail("server closed the connection unexpectedly".to_string());
            return Err(PgError::ConnectionClosed);
        }

        if !self.out_buf.is_empty() && self.flush() == FlushStatus::Failed {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.in_flight
    }

    fn next_result(&mut self) -> Option<ServerResult> {
        if self.in_flight {
            return None;
        }
        self.completed.pop_front()
    }

    fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    fn backend_pid(&self) -> i32 {
        self.backend_pid
    }
}

impl Drop for WireSession {
    fn drop(&mut self) {
        if self.status == ConnStatus::Ok {
            if let Some(ref socket) = self.socket {
                // Best effort; the socket closes either way.
                let _ = (&*socket).write(&TerminateMessage.encode());
            }
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn resolve(target: &Target) -> Result<Vec<SockAddr>, String> {
    match target {
        Target::Tcp { host, port } => {
            let addrs: Vec<SockAddr> = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|e| format!("could not translate host name \"{}\" to address: {}", host, e))?
                .map(SockAddr::from)
                .collect();
            if addrs.is_empty() {
                return Err(format!(
                    "could not translate host name \"{}\" to address",
                    host
                ));
            }
            Ok(addrs)
        }
        #[cfg(unix)]
        Target::Unix(path) => SockAddr::unix(path)
            .map(|addr| vec![addr])
            .map_err(|e| format!("invalid socket path \"{}\": {}", path.display(), e)),
        #[cfg(not(unix))]
        Target::Unix(path) => Err(format!(
            "unix-domain socket \"{}\" is not supported on this platform",
            path.display()
        )),
    }
}

/// Create a non-blocking socket and start connecting it.
/// Returns the socket and whether the connect already completed.
fn open_socket(addr: &SockAddr) -> io::Result<(Socket, bool)> {
    let is_unix = addr.as_socket().is_none();
    let socket = if is_unix {
        Socket::new(addr.domain(), Type::STREAM, None)?
    } else {
        let socket = Socket::new(addr.domain(), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket
    };
    socket.set_nonblocking(true)?;

    match socket.connect(addr) {
        Ok(()) => Ok((socket, true)),
        Err(ref e) if connect_in_progress(e) => Ok((socket, false)),
        Err(e) => Err(e),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn describe_connect_error(info: &ConnInfo, err: &io::Error) -> String {
    match info.target() {
        Target::Tcp { host, port } => format!(
            "could not connect to server: {}\n\tIs the server running on host \"{}\" and accepting\n\tTCP/IP connections on port {}?",
            err, host, port
        ),
        Target::Unix(path) => format!(
            "could not connect to server: {}\n\tIs the server running locally and accepting\n\tconnections on Unix domain socket \"{}\"?",
            err,
            path.display()
        ),
    }
}

fn io_message(context: &str, err: &io::Error) -> String {
    format!("{}: {}", context, err)
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

#[cfg(unix)]
fn raw_handle(socket: &Socket) -> SocketHandle {
    use std::os::unix::io::AsRawFd;
    SocketHandle::from(socket.as_raw_fd())
}

#[cfg(windows)]
fn raw_handle(socket: &Socket) -> SocketHandle {
    use std::os::windows::io::AsRawSocket;
    SocketHandle::new(socket.as_raw_socket() as i64)
}
