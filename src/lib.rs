//! Reactor-driven asynchronous PostgreSQL connections.
//!
//! A [`Connection`] never blocks and owns no thread. The embedding
//! application runs the poll loop: it watches the socket for the directions
//! the connection asks for through a [`Reactor`], calls
//! [`Connection::handle_io_event`] when one fires, and receives everything
//! that happens as [`Event`]s on the connection's [`EventStream`].
//!
//! On unix, [`Driver`] does the watching with tokio.

pub mod connection;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_loop;
mod notify;
pub mod pg;

#[cfg(unix)]
pub mod driver;

#[cfg(test)]
mod tests;

pub use connection::{Connection, Phase};
pub use decoder::{Field, ResultRow};
pub use dispatch::QueryRequest;
pub use error::{ClientError, Result};
pub use event::{ErrorEvent, Event, EventKind, EventSink, EventStream, Notice, Notification};
pub use event_loop::{Direction, Interest, InterestRegistry, IoWatcher, Reactor, Readiness, SocketHandle};
pub use pg::{ErrorInfo, Oid};

#[cfg(unix)]
pub use driver::{Driver, TokioReactor};
