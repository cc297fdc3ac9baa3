//! Connection state machine tests against a scripted session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;

use crate::connection::{Connection, Phase};
use crate::error::ClientError;
use crate::event::{ErrorEvent, Event, EventStream, Notice, Notification};
use crate::event_loop::{Direction, Interest, InterestRegistry, Reactor, Readiness, SocketHandle};
use crate::pg::session::{
    Column, ConnStatus, Connector, ExecStatus, FlushStatus, NoticeHandler, PollingStatus,
    ServerResult, Session,
};
use crate::pg::{Oid, PgError, PgResult, TransactionStatus};

// ============================================================================
// Scripted session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sent {
    text: String,
    params: Option<Vec<String>>,
}

struct Script {
    status: ConnStatus,
    socket: SocketHandle,
    polls: VecDeque<PollingStatus>,
    error_message: String,
    fail_nonblocking: bool,
    fail_send: bool,
    fail_consume: bool,
    flushes: VecDeque<FlushStatus>,
    pending_output: bool,
    busy: bool,
    results: VecDeque<ServerResult>,
    notifications: VecDeque<Notification>,
    notices: VecDeque<String>,
    notice_handler: Option<NoticeHandler>,
    sent: Vec<Sent>,
    released: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            status: ConnStatus::Started,
            socket: SocketHandle::new(7),
            polls: VecDeque::new(),
            error_message: String::new(),
            fail_nonblocking: false,
            fail_send: false,
            fail_consume: false,
            flushes: VecDeque::new(),
            pending_output: false,
            busy: false,
            results: VecDeque::new(),
            notifications: VecDeque::new(),
            notices: VecDeque::new(),
            notice_handler: None,
            sent: Vec::new(),
            released: false,
        }
    }
}

type Shared = Arc<Mutex<Script>>;

struct ScriptedSession(Shared);

struct ScriptedConnector {
    script: Shared,
    refuse: bool,
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn start(&self, _conninfo: &str) -> PgResult<ScriptedSession> {
        if self.refuse {
            return Err(PgError::Config("out of memory".into()));
        }
        Ok(ScriptedSession(self.script.clone()))
    }
}

impl Session for ScriptedSession {
    fn set_nonblocking(&mut self) -> PgResult<()> {
        if self.0.lock().fail_nonblocking {
            return Err(PgError::Protocol("cannot set non-blocking".into()));
        }
        Ok(())
    }

    fn is_nonblocking(&self) -> bool {
        true
    }

    fn status(&self) -> ConnStatus {
        self.0.lock().status
    }

    fn socket(&self) -> SocketHandle {
        self.0.lock().socket
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let mut script = self.0.lock();
        let status = script.polls.pop_front().unwrap_or(PollingStatus::Reading);
        if status == PollingStatus::Ok {
            script.status = ConnStatus::Ok;
        }
        status
    }

    fn error_message(&self) -> String {
        self.0.lock().error_message.clone()
    }

    fn set_notice_handler(&mut self, handler: NoticeHandler) {
        self.0.lock().notice_handler = Some(handler);
    }

    fn send_query(&mut self, text: &str) -> PgResult<()> {
        self.record(text, None)
    }

    fn send_query_params(&mut self, text: &str, params: &[String]) -> PgResult<()> {
        self.record(text, Some(params.to_vec()))
    }

    fn flush(&mut self) -> FlushStatus {
        let mut script = self.0.lock();
        let status = script.flushes.pop_front().unwrap_or(FlushStatus::Done);
        if status == FlushStatus::Done {
            script.pending_output = false;
        }
        status
    }

    fn has_pending_output(&self) -> bool {
        self.0.lock().pending_output
    }

    fn consume_input(&mut self) -> PgResult<()> {
        let mut script = self.0.lock();
        if script.fail_consume {
            script.error_message = "server closed the connection unexpectedly".into();
            return Err(PgError::ConnectionClosed);
        }
        let notices: Vec<String> = script.notices.drain(..).collect();
        if let Some(handler) = script.notice_handler.as_mut() {
            for notice in &notices {
                handler(notice);
            }
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.0.lock().busy
    }

    fn next_result(&mut self) -> Option<ServerResult> {
        let mut script = self.0.lock();
        if script.busy {
            return None;
        }
        script.results.pop_front()
    }

    fn next_notification(&mut self) -> Option<Notification> {
        self.0.lock().notifications.pop_front()
    }

    fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::Idle
    }

    fn parameter(&self, _name: &str) -> Option<&str> {
        None
    }

    fn backend_pid(&self) -> i32 {
        4242
    }
}

impl ScriptedSession {
    fn record(&mut self, text: &str, params: Option<Vec<String>>) -> PgResult<()> {
        let mut script = self.0.lock();
        if script.fail_send {
            script.error_message = "another command is already in progress".into();
            return Err(PgError::Busy);
        }
        script.sent.push(Sent {
            text: text.to_string(),
            params,
        });
        script.busy = true;
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        let mut script = self.0.lock();
        script.released = true;
        script.notice_handler = None;
    }
}

// ============================================================================
// Helpers
// ============================================================================

type TestConnection = Connection<ScriptedConnector, InterestRegistry>;

fn setup(script: Script) -> (TestConnection, EventStream, Shared) {
    let script = Arc::new(Mutex::new(script));
    let connector = ScriptedConnector {
        script: script.clone(),
        refuse: false,
    };
    let (conn, events) = Connection::new(connector, InterestRegistry::new());
    (conn, events, script)
}

/// A connection that has completed its handshake.
fn idle() -> (TestConnection, EventStream, Shared) {
    let (mut conn, mut events, script) = setup(Script {
        polls: [PollingStatus::Ok].into(),
        ..Script::default()
    });
    conn.connect("host=localhost").unwrap();
    conn.handle_io_event(Readiness::WRITABLE);
    assert_eq!(conn.phase(), Phase::Idle);
    assert_eq!(events.try_recv().unwrap(), Event::Connect);
    (conn, events, script)
}

fn drain(events: &mut EventStream) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn tuples(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> ServerResult {
    let mut result = ServerResult::new(ExecStatus::TuplesOk);
    result.columns = columns
        .iter()
        .map(|(name, oid)| Column {
            name: name.to_string(),
            type_oid: *oid,
        })
        .collect();
    result.rows = rows
        .iter()
        .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
        .collect();
    result
}

/// The server answers the in-flight request with `results`.
fn answer(script: &Shared, results: Vec<ServerResult>) {
    let mut script = script.lock();
    script.results.extend(results);
    script.busy = false;
}

// ============================================================================
// Connecting
// ============================================================================

mod connecting {
    use super::*;

    #[test]
    fn test_connect_arms_write_interest() {
        let (mut conn, mut events, _script) = setup(Script::default());
        conn.connect("host=localhost").unwrap();

        assert_eq!(conn.phase(), Phase::ConnectingWriting);
        assert_eq!(conn.reactor().interest(), Interest::WRITABLE);
        assert_eq!(conn.reactor().socket(), Some(SocketHandle::new(7)));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_poll_sequence_emits_one_connect() {
        let (mut conn, mut events, _script) = setup(Script {
            polls: [
                PollingStatus::Writing,
                PollingStatus::Reading,
                PollingStatus::Ok,
            ]
            .into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();

        conn.handle_io_event(Readiness::WRITABLE);
        assert_eq!(conn.phase(), Phase::ConnectingWriting);
        assert_eq!(conn.reactor().interest(), Interest::WRITABLE);

        conn.handle_io_event(Readiness::WRITABLE);
        assert_eq!(conn.phase(), Phase::ConnectingReading);
        assert_eq!(conn.reactor().interest(), Interest::READABLE);

        conn.handle_io_event(Readiness::READABLE);
        assert_eq!(conn.phase(), Phase::Idle);
        assert_eq!(conn.reactor().interest(), Interest::READABLE);

        assert_eq!(drain(&mut events), vec![Event::Connect]);
        assert_eq!(conn.backend_pid(), Some(4242));
    }

    #[test]
    fn test_redundant_interest_changes_are_not_forwarded() {
        let (mut conn, _events, _script) = setup(Script {
            polls: [PollingStatus::Writing, PollingStatus::Writing].into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();
        let after_connect = conn.reactor().changes();

        conn.handle_io_event(Readiness::WRITABLE);
        conn.handle_io_event(Readiness::WRITABLE);
        assert_eq!(conn.reactor().changes(), after_connect);
    }

    #[test]
    fn test_failed_handshake_emits_one_error_and_closes() {
        let (mut conn, mut events, script) = setup(Script {
            polls: [PollingStatus::Reading, PollingStatus::Failed].into(),
            error_message: "FATAL:  password authentication failed for user \"app\"".into(),
            ..Script::default()
        });
        conn.connect("host=localhost user=app").unwrap();
        conn.handle_io_event(Readiness::WRITABLE);
        conn.handle_io_event(Readiness::READABLE);

        assert_eq!(conn.phase(), Phase::Closed);
        assert!(conn.reactor().interest().is_empty());
        assert!(script.lock().released);

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Error(ErrorEvent::Message(msg)) => {
                assert!(msg.contains("password authentication failed"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nothing_happens_after_failed_handshake() {
        let (mut conn, mut events, _script) = setup(Script {
            polls: [PollingStatus::Failed].into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();
        conn.handle_io_event(Readiness::WRITABLE);
        let _ = drain(&mut events);

        conn.handle_io_event(Readiness::READABLE | Readiness::WRITABLE);
        assert!(drain(&mut events).is_empty());
        assert!(matches!(
            conn.send("SELECT 1"),
            Err(ClientError::InvalidState {
                phase: Phase::Closed,
                ..
            })
        ));
    }

    #[test]
    fn test_active_poll_status_is_ignored() {
        let (mut conn, mut events, _script) = setup(Script {
            polls: [PollingStatus::Active].into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();
        conn.handle_io_event(Readiness::WRITABLE);

        assert_eq!(conn.phase(), Phase::ConnectingWriting);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_refused_session_is_a_setup_error() {
        let script = Arc::new(Mutex::new(Script::default()));
        let connector = ScriptedConnector {
            script,
            refuse: true,
        };
        let (mut conn, mut events) = Connection::new(connector, InterestRegistry::new());

        assert!(matches!(
            conn.connect("host=localhost"),
            Err(ClientError::SetupError(_))
        ));
        assert_eq!(conn.phase(), Phase::Closed);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_bad_status_is_a_setup_error() {
        let (mut conn, mut events, script) = setup(Script {
            status: ConnStatus::Bad,
            error_message: "could not translate host name \"nowhere\" to address".into(),
            ..Script::default()
        });

        match conn.connect("host=nowhere") {
            Err(ClientError::SetupError(msg)) => assert!(msg.contains("nowhere")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.phase(), Phase::Closed);
        assert!(script.lock().released);
        assert_eq!(conn.reactor().changes(), 0);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_nonblocking_failure_is_a_setup_error() {
        let (mut conn, _events, _script) = setup(Script {
            fail_nonblocking: true,
            ..Script::default()
        });
        assert!(matches!(
            conn.connect("host=localhost"),
            Err(ClientError::SetupError(_))
        ));
        assert_eq!(conn.phase(), Phase::Closed);
    }

    #[test]
    fn test_invalid_socket_is_a_setup_error() {
        let (mut conn, _events, _script) = setup(Script {
            socket: SocketHandle::INVALID,
            ..Script::default()
        });
        assert!(matches!(
            conn.connect("host=localhost"),
            Err(ClientError::SetupError(_))
        ));
        assert_eq!(conn.reactor().changes(), 0);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (mut conn, _events, _script) = setup(Script::default());
        conn.connect("host=localhost").unwrap();
        assert!(matches!(
            conn.connect("host=localhost"),
            Err(ClientError::InvalidState {
                operation: "connect",
                phase: Phase::ConnectingWriting,
            })
        ));
    }

    #[test]
    fn test_empty_conninfo_is_rejected() {
        let (mut conn, _events, _script) = setup(Script::default());
        assert!(matches!(
            conn.connect("  "),
            Err(ClientError::ValidationError(_))
        ));
        assert_eq!(conn.phase(), Phase::Disconnected);
    }
}

// ============================================================================
// Querying
// ============================================================================

mod querying {
    use super::*;

    #[test]
    fn test_select_one() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT 1 AS n").unwrap();
        assert_eq!(conn.phase(), Phase::Busy);
        assert_eq!(
            script.lock().sent,
            vec![Sent {
                text: "SELECT 1 AS n".into(),
                params: None
            }]
        );

        let mut result = tuples(&[("n", Oid::INT4)], &[&[Some("1")]]);
        result.command_tag = Some("SELECT 1".into());
        answer(&script, vec![result]);
        conn.handle_io_event(Readiness::READABLE);

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        let Event::Row(ref row) = events[0] else {
            panic!("expected a row, got {:?}", events[0])
        };
        let field = row.get("n").unwrap();
        assert_eq!(field.raw_value.as_deref(), Some("1"));
        assert_eq!(field.type_oid, Oid(23));
        assert_eq!(events[1], Event::ReadyForQuery);
        assert_eq!(conn.phase(), Phase::Idle);
    }

    #[test]
    fn test_row_events_match_row_count_then_one_ready() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT * FROM t; UPDATE t SET x = 1").unwrap();
        answer(
            &script,
            vec![
                tuples(
                    &[("x", Oid::TEXT)],
                    &[&[Some("a")], &[None], &[Some("c")]],
                ),
                ServerResult::new(ExecStatus::CommandOk),
            ],
        );
        conn.handle_io_event(Readiness::READABLE);

        let events = drain(&mut events);
        let rows = events.iter().filter(|e| matches!(e, Event::Row(_))).count();
        let ready = events
            .iter()
            .filter(|e| matches!(e, Event::ReadyForQuery))
            .count();
        assert_eq!(rows, 3);
        assert_eq!(ready, 1);
        assert_eq!(events.last(), Some(&Event::ReadyForQuery));
    }

    #[test]
    fn test_no_ready_while_server_busy() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT pg_sleep(1)").unwrap();

        conn.handle_io_event(Readiness::READABLE);
        assert_eq!(conn.phase(), Phase::Busy);
        assert!(drain(&mut events).is_empty());

        answer(&script, vec![ServerResult::new(ExecStatus::TuplesOk)]);
        conn.handle_io_event(Readiness::READABLE);
        assert_eq!(drain(&mut events), vec![Event::ReadyForQuery]);
    }

    #[test]
    fn test_server_error_becomes_structured_event() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELEC 1").unwrap();
        let fields: HashMap<u8, String> = [
            (b'S', "ERROR".to_string()),
            (b'C', "42601".to_string()),
            (b'M', "syntax error at or near \"SELEC\"".to_string()),
            (b'P', "1".to_string()),
        ]
        .into();
        answer(&script, vec![ServerResult::error(fields)]);
        conn.handle_io_event(Readiness::READABLE);

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        let Event::Error(ErrorEvent::Server(ref info)) = events[0] else {
            panic!("expected a server error, got {:?}", events[0])
        };
        assert_eq!(info.code.as_deref(), Some("42601"));
        assert_eq!(info.position.as_deref(), Some("1"));
        assert!(info.detail.is_none());
        assert_eq!(events[1], Event::ReadyForQuery);
        assert_eq!(conn.phase(), Phase::Idle);
    }

    #[test]
    fn test_send_outside_idle_is_rejected() {
        let (mut conn, _events, script) = setup(Script::default());
        assert!(matches!(
            conn.send("SELECT 1"),
            Err(ClientError::InvalidState {
                phase: Phase::Disconnected,
                ..
            })
        ));

        let (mut conn, _events, script2) = idle();
        conn.send("SELECT 1").unwrap();
        assert!(matches!(
            conn.send("SELECT 2"),
            Err(ClientError::InvalidState {
                phase: Phase::Busy,
                ..
            })
        ));
        assert!(script.lock().sent.is_empty());
        assert_eq!(script2.lock().sent.len(), 1);
    }

    #[test]
    fn test_non_string_parameter_sends_nothing() {
        let (mut conn, mut events, script) = idle();
        match conn.send_with_params("SELECT $1", &[json!(42)]) {
            Err(ClientError::ValidationError(msg)) => assert!(msg.contains("$1")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(script.lock().sent.is_empty());
        assert_eq!(conn.phase(), Phase::Idle);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_string_parameters_are_forwarded() {
        let (mut conn, _events, script) = idle();
        conn.send_with_params("SELECT $1::int + $2::int", &[json!("1"), json!("2")])
            .unwrap();
        assert_eq!(
            script.lock().sent[0].params,
            Some(vec!["1".to_string(), "2".to_string()])
        );
        assert_eq!(conn.phase(), Phase::Busy);
    }

    #[test]
    fn test_transmission_failure_leaves_idle() {
        let (mut conn, _events, script) = idle();
        script.lock().fail_send = true;
        assert!(matches!(
            conn.send("SELECT 1"),
            Err(ClientError::TransmissionError(PgError::Busy))
        ));
        assert_eq!(conn.phase(), Phase::Idle);

        script.lock().fail_send = false;
        conn.send("SELECT 1").unwrap();
        assert_eq!(conn.phase(), Phase::Busy);
    }

    #[test]
    fn test_hard_flush_failure_is_a_transmission_error() {
        let (mut conn, _events, script) = idle();
        script.lock().flushes = [FlushStatus::Failed].into();
        assert!(matches!(
            conn.send("SELECT 1"),
            Err(ClientError::TransmissionError(_))
        ));
        assert_eq!(conn.phase(), Phase::Idle);
    }

    #[test]
    fn test_pending_flush_watches_writability_until_done() {
        let (mut conn, _events, script) = idle();
        script.lock().flushes = [FlushStatus::Pending, FlushStatus::Pending].into();
        conn.send("SELECT 1").unwrap();
        assert_eq!(conn.reactor().interest(), Interest::both());

        conn.handle_io_event(Readiness::WRITABLE);
        assert_eq!(conn.reactor().interest(), Interest::both());

        conn.handle_io_event(Readiness::WRITABLE);
        assert_eq!(conn.reactor().interest(), Interest::READABLE);
    }

    #[test]
    fn test_replies_queued_during_read_arm_write() {
        let (mut conn, _events, script) = idle();
        conn.send("COPY t FROM STDIN").unwrap();
        script.lock().pending_output = true;

        conn.handle_io_event(Readiness::READABLE);
        assert!(conn.reactor().interest().is_writable());
    }

    #[test]
    fn test_prepared_statements_are_not_implemented() {
        let (mut conn, _events, script) = idle();
        assert!(matches!(
            conn.send_prepare("s1", "SELECT $1", 1),
            Err(ClientError::NotImplemented("sendPrepare"))
        ));
        assert!(matches!(
            conn.send_query_prepared("s1", &[json!("1")]),
            Err(ClientError::NotImplemented("sendQueryPrepared"))
        ));
        assert_eq!(conn.phase(), Phase::Idle);
        assert!(script.lock().sent.is_empty());
    }

    #[test]
    fn test_read_failure_reports_and_stops_reading() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT 1").unwrap();
        script.lock().fail_consume = true;

        conn.handle_io_event(Readiness::READABLE);
        assert_eq!(
            drain(&mut events),
            vec![Event::Error(ErrorEvent::Message(
                "server closed the connection unexpectedly".into()
            ))]
        );
        assert!(!conn.reactor().interest().is_readable());
        assert_eq!(conn.phase(), Phase::Busy);
    }

    #[test]
    fn test_error_readiness_is_ignored() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT 1").unwrap();
        answer(&script, vec![]);
        conn.handle_io_event(Readiness::ERROR | Readiness::READABLE);
        assert_eq!(conn.phase(), Phase::Busy);
        assert!(drain(&mut events).is_empty());
    }
}

// ============================================================================
// Notices and notifications
// ============================================================================

mod out_of_band {
    use super::*;

    #[test]
    fn test_notice_is_forwarded_verbatim() {
        let (mut conn, mut events, script) = idle();
        script.lock().notices.push_back("hi".into());
        conn.handle_io_event(Readiness::READABLE);
        assert_eq!(drain(&mut events), vec![Event::Notice(Notice("hi".into()))]);
    }

    #[test]
    fn test_notice_during_query_precedes_ready() {
        let (mut conn, mut events, script) = idle();
        conn.send("DO $$ BEGIN RAISE NOTICE 'hi'; END $$").unwrap();
        script.lock().notices.push_back("hi".into());
        answer(&script, vec![ServerResult::new(ExecStatus::CommandOk)]);
        conn.handle_io_event(Readiness::READABLE);

        assert_eq!(
            drain(&mut events),
            vec![Event::Notice(Notice("hi".into())), Event::ReadyForQuery]
        );
    }

    #[test]
    fn test_notifications_are_drained_in_order() {
        let (mut conn, mut events, script) = idle();
        {
            let mut script = script.lock();
            for payload in ["one", "two"] {
                script.notifications.push_back(Notification {
                    channel: "jobs".into(),
                    payload: payload.into(),
                    process_id: 99,
                });
            }
        }
        conn.handle_io_event(Readiness::READABLE);

        let payloads: Vec<String> = drain(&mut events)
            .into_iter()
            .map(|e| match e {
                Event::Notification(n) => n.payload,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(payloads, ["one", "two"]);
    }
}

// ============================================================================
// Closing
// ============================================================================

mod closing {
    use super::*;

    #[test]
    fn test_end_while_busy_releases_everything() {
        let (mut conn, mut events, script) = idle();
        conn.send("SELECT 1").unwrap();
        answer(&script, vec![tuples(&[("n", Oid::INT4)], &[&[Some("1")]])]);

        conn.end();
        assert_eq!(conn.phase(), Phase::Closed);
        assert!(conn.reactor().interest().is_empty());
        assert!(conn.session().is_none());
        {
            let script = script.lock();
            assert!(script.released);
            assert!(script.notice_handler.is_none());
        }

        conn.handle_io_event(Readiness::READABLE);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_end_is_idempotent() {
        let (mut conn, _events, _script) = idle();
        conn.end();
        let changes = conn.reactor().changes();
        conn.end();
        assert_eq!(conn.reactor().changes(), changes);
        assert_eq!(conn.phase(), Phase::Closed);
    }

    #[test]
    fn test_end_before_connect() {
        let (mut conn, _events, _script) = setup(Script::default());
        conn.end();
        assert_eq!(conn.phase(), Phase::Closed);
        assert_eq!(conn.reactor().changes(), 0);
    }

    /// Records, for each release, whether the session was still open.
    struct ReleaseOrder {
        script: Shared,
        open_at_release: Vec<bool>,
    }

    impl Reactor for ReleaseOrder {
        fn start(&mut self, _: SocketHandle, _: Direction) {}
        fn stop(&mut self, _: SocketHandle, _: Direction) {}
        fn release(&mut self, _: SocketHandle) {
            self.open_at_release.push(!self.script.lock().released);
        }
    }

    fn with_release_order(script: Script) -> (Connection<ScriptedConnector, ReleaseOrder>, Shared) {
        let script = Arc::new(Mutex::new(script));
        let connector = ScriptedConnector {
            script: script.clone(),
            refuse: false,
        };
        let reactor = ReleaseOrder {
            script: script.clone(),
            open_at_release: Vec::new(),
        };
        let (conn, _events) = Connection::new(connector, reactor);
        (conn, script)
    }

    #[test]
    fn test_socket_released_before_session_on_failed_handshake() {
        let (mut conn, script) = with_release_order(Script {
            polls: [PollingStatus::Failed].into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();
        conn.handle_io_event(Readiness::WRITABLE);

        assert_eq!(conn.phase(), Phase::Closed);
        assert!(script.lock().released);
        assert_eq!(conn.reactor().open_at_release, [true]);
    }

    #[test]
    fn test_socket_released_before_session_on_end() {
        let (mut conn, script) = with_release_order(Script {
            polls: [PollingStatus::Ok].into(),
            ..Script::default()
        });
        conn.connect("host=localhost").unwrap();
        conn.handle_io_event(Readiness::WRITABLE);
        conn.end();
        conn.end();

        assert!(script.lock().released);
        assert_eq!(conn.reactor().open_at_release, [true]);
    }

    #[test]
    fn test_drop_releases_session() {
        let (conn, _events, script) = idle();
        drop(conn);
        assert!(script.lock().released);
    }
}
