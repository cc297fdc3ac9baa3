//! PostgreSQL protocol session.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `session`: The non-blocking session contract the connection drives
//! - `wire`: Session implementation over a non-blocking socket
//! - `config`: Connection string parsing
//! - `scram`: SCRAM-SHA-256 and MD5 password authentication
//! - `types`: Type OIDs and format codes
//! - `error`: Protocol errors and structured server diagnostics

pub mod config;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod session;
pub mod types;
pub mod wire;


pub use config::{ConnInfo, Target};
pub use error::{ErrorInfo, PgError, PgResult};
pub use protocol::TransactionStatus;
pub use types::{Format, Oid};
pub use wire::{WireConnector, WireSession};
