/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

use fibered_pg_conn::{AdminCommand, ConnectionId, DriverError};

use crate::broadcast::BroadcastReceipt;

/// Error types for connection pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The driver failed the query. Carries the driver's error unchanged.
   #[error(transparent)]
   Driver(DriverError),

   /// A query got no result within the configured query timeout.
   #[error("query timed out after {0:?}")]
   QueryTimeout(Duration),

   /// A suspending query was issued outside of a running event loop.
   #[error("no event loop is running on this thread")]
   NoEventLoop,

   /// Registering a socket with the reactor failed.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// No connection was released within the configured acquire timeout.
   #[error("no connection became available within {waited:?}")]
   PoolExhausted { waited: Duration },

   /// An administrative command failed on some connections of the pool.
   #[error(
      "broadcast of '{label}' failed on {count} connection(s): {details}",
      label = .command.label(),
      count = .failed.len(),
      details = describe_failures(.failed)
   )]
   BroadcastPartialFailure {
      command: AdminCommand,
      failed: Vec<(ConnectionId, DriverError)>,
      /// Connections the command did reach.
      applied: usize,
      /// Applications still queued on checked-out connections. They run on
      /// release regardless; the receipt lets the caller wait for them.
      postponed: Option<BroadcastReceipt>,
   },

   /// A pool needs at least one connection.
   #[error("pool size must be at least 1")]
   InvalidPoolSize,

   /// Opening one of the pool's connections failed.
   #[error("failed to open {id}: {source}")]
   Connect { id: ConnectionId, source: DriverError },

   /// The connection handed to a waiting caller never arrived.
   #[error("connection hand-off channel closed")]
   HandoffLost,
}

fn describe_failures(failed: &[(ConnectionId, DriverError)]) -> String {
   failed
      .iter()
      .map(|(id, e)| format!("{}: {}", id, e))
      .collect::<Vec<_>>()
      .join("; ")
}

impl From<DriverError> for Error {
   fn from(e: DriverError) -> Self {
      Error::Driver(e)
   }
}

impl From<fibered_pg_conn::Error> for Error {
   fn from(e: fibered_pg_conn::Error) -> Self {
      match e {
         fibered_pg_conn::Error::Driver(e) => Error::Driver(e),
         fibered_pg_conn::Error::QueryTimeout(limit) => Error::QueryTimeout(limit),
         fibered_pg_conn::Error::NoEventLoop => Error::NoEventLoop,
         fibered_pg_conn::Error::Io(e) => Error::Io(e),
      }
   }
}

impl Error {
   /// The driver failure behind this error, if it came from the driver.
   pub fn as_driver_error(&self) -> Option<&DriverError> {
      match self {
         Error::Driver(e) => Some(e),
         Error::Connect { source, .. } => Some(source),
         _ => None,
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Driver(e) => match e.sqlstate() {
            Some(code) => format!("PG_{}", code),
            None => "DRIVER_ERROR".to_string(),
         },
         Error::QueryTimeout(_) => "QUERY_TIMEOUT".to_string(),
         Error::NoEventLoop => "NO_EVENT_LOOP".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::PoolExhausted { .. } => "POOL_EXHAUSTED".to_string(),
         Error::BroadcastPartialFailure { .. } => "BROADCAST_PARTIAL_FAILURE".to_string(),
         Error::InvalidPoolSize => "INVALID_POOL_SIZE".to_string(),
         Error::Connect { .. } => "CONNECTION_ERROR".to_string(),
         Error::HandoffLost => "HANDOFF_LOST".to_string(),
      }
   }
}
