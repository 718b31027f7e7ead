//! The driver capability fibered connections are built on

#[cfg(unix)]
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DriverResult;
use crate::session::SessionInfo;

/// An administrative command that must reach every connection in a pool.
///
/// These change per-session state (prepared statements, session settings), so
/// a pool applies them to idle connections right away and postpones them on
/// connections that somebody else has checked out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminCommand {
   /// Create a named prepared statement.
   Prepare {
      name: String,
      sql: String,
      /// Parameter type OIDs; empty lets the server infer them.
      #[serde(default)]
      param_types: Vec<u32>,
   },
   /// Drop a named prepared statement.
   Deallocate { name: String },
   /// A session-level statement such as `SET search_path TO app`.
   Session { sql: String },
}

impl AdminCommand {
   pub fn prepare(name: impl Into<String>, sql: impl Into<String>) -> Self {
      AdminCommand::Prepare {
         name: name.into(),
         sql: sql.into(),
         param_types: Vec::new(),
      }
   }

   pub fn session(sql: impl Into<String>) -> Self {
      AdminCommand::Session { sql: sql.into() }
   }

   /// Short label used in logs.
   pub fn label(&self) -> &str {
      match self {
         AdminCommand::Prepare { name, .. } => name,
         AdminCommand::Deallocate { name } => name,
         AdminCommand::Session { sql } => sql,
      }
   }
}

/// Low-level driver operations a fibered connection needs.
///
/// Implementations wrap one physical session. `dispatch` must not block; the
/// connection waits for [`Transport::socket`] to become readable before calling
/// [`Transport::fetch_result`]. `execute_sync` is only used when no event loop
/// is running (setup code, non-Tokio executors).
pub trait Transport: Send + 'static {
   /// The driver's raw result object.
   type Output: Send + 'static;

   /// Send a query without waiting for its result.
   fn dispatch(&mut self, sql: &str, params: &[JsonValue]) -> DriverResult<()>;

   /// Collect the outcome of the last dispatched query.
   fn fetch_result(&mut self) -> DriverResult<Self::Output>;

   /// Socket that becomes readable once a dispatched query has a result.
   #[cfg(unix)]
   fn socket(&self) -> RawFd;

   /// Run a query to completion, blocking the calling thread.
   fn execute_sync(&mut self, sql: &str, params: &[JsonValue]) -> DriverResult<Self::Output>;

   /// Apply an administrative command synchronously.
   fn apply(&mut self, command: &AdminCommand) -> DriverResult<()>;

   /// Abandon the in-flight query after a timeout.
   fn cancel(&mut self) -> DriverResult<()> {
      Ok(())
   }

   /// Local session metadata used for quoting and escaping.
   fn session(&self) -> SessionInfo;
}
