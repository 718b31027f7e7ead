//! # fibered-pg-conn
//!
//! Database connections that cooperate with a single-threaded event loop.
//!
//! A query normally blocks until the server answers. A [`FiberedConnection`]
//! instead dispatches the query, registers the connection's socket with the
//! Tokio reactor and suspends the calling task until the socket is readable.
//! Other tasks keep running on the same thread in the meantime.
//!
//! ## Core Types
//!
//! - **[`Transport`]**: The driver capability connections are built on
//! - **[`FiberedConnection`]**: One physical connection with suspending queries
//!   and a queue of postponed administrative commands
//! - **[`ConnectionShared`]**: The part of a connection a pool keeps while the
//!   connection is checked out
//! - **[`AdminCommand`]**: Session-level command that must reach every connection
//! - **[`SessionInfo`]**: Session metadata and the quoting rules built on it
//! - **[`Error`]**: Error type for connection operations

mod connection;
mod error;
mod postponed;
mod session;
mod transport;
#[cfg(unix)]
mod watcher;

#[cfg(all(unix, any(test, feature = "test-transport")))]
pub mod testing;

// Re-export public types
pub use connection::{ConnectionId, ConnectionShared, FiberedConnection, reactor_running};
pub use error::{DriverError, DriverResult, Error, Result};
pub use postponed::{Completion, PostponedOperation, PostponedReport};
pub use session::SessionInfo;
pub use transport::{AdminCommand, Transport};
#[cfg(unix)]
pub use watcher::WatchStats;
