//! Error types for the connection engine.
//!
//! These are the failures reported synchronously to whoever called into the
//! engine. Failures discovered later, inside a readiness callback, travel as
//! [`Event::Error`](crate::event::Event::Error) instead.

use thiserror::Error;

use crate::connection::Phase;
use crate::pg::{ErrorInfo, PgError};

#[derive(Error, Debug)]
pub enum ClientError {
    /// The session could not be allocated or started; the connection is unusable.
    #[error("Connection setup failed: {0}")]
    SetupError(String),

    /// The handshake failed; the connection is unusable.
    #[error("Connection handshake failed: {0}")]
    HandshakeError(String),

    /// The session refused to transmit a request; the connection stays idle.
    #[error("Query transmission failed: {0}")]
    TransmissionError(#[source] PgError),

    /// The server rejected a query.
    #[error("{0}")]
    ServerError(ErrorInfo),

    /// Caller input was malformed; nothing was sent.
    #[error("Invalid argument: {0}")]
    ValidationError(String),

    #[error("Cannot {operation} while connection is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, ClientError>;
