//! Events a connection emits to the embedding application.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::decoder::ResultRow;
use crate::pg::ErrorInfo;

/// The fixed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Error,
    Row,
    ReadyForQuery,
    Notice,
    Notification,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Connect,
        EventKind::Error,
        EventKind::Row,
        EventKind::ReadyForQuery,
        EventKind::Notice,
        EventKind::Notification,
    ];

    /// Name under which bindings publish the event.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Error => "error",
            EventKind::Row => "row",
            EventKind::ReadyForQuery => "readyForQuery",
            EventKind::Notice => "notice",
            EventKind::Notification => "notification",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorEvent {
    /// Structured diagnostic sent by the server for a failed query.
    Server(ErrorInfo),
    /// Diagnostic text without structure (handshake and transport failures).
    Message(String),
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorEvent::Server(info) => write!(f, "{}", info),
            ErrorEvent::Message(msg) => f.write_str(msg),
        }
    }
}

/// Server notice text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Notice(pub String);

/// LISTEN/NOTIFY message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub process_id: i32,
}

/// Something the connection reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Error(ErrorEvent),
    Row(ResultRow),
    ReadyForQuery,
    Notice(Notice),
    Notification(Notification),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect => EventKind::Connect,
            Event::Error(_) => EventKind::Error,
            Event::Row(_) => EventKind::Row,
            Event::ReadyForQuery => EventKind::ReadyForQuery,
            Event::Notice(_) => EventKind::Notice,
            Event::Notification(_) => EventKind::Notification,
        }
    }
}

/// Sending half of a connection's event channel.
///
/// Emission never blocks. Events sent after the receiver is gone are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

/// Receiving half of a connection's event channel.
pub type EventStream = mpsc::UnboundedReceiver<Event>;

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(event = %kind, "event dropped, no receiver");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
