use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use fibered_pg_conn::{AdminCommand, ConnectionId, FiberedConnection, Transport};
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::Result;
use crate::broadcast::BroadcastReceipt;
use crate::pool::{OwnerId, SharedPool};

/// RAII guard for exclusive use of one pooled connection.
///
/// The connection returns to its pool when the guard is dropped: postponed
/// commands run first, then the connection goes to the longest waiting caller
/// or back to the idle set.
#[must_use = "if unused, the connection is immediately released"]
pub struct PooledConnection<T: Transport> {
   conn: Option<FiberedConnection<T>>,
   owner: OwnerId,
   pool: Arc<SharedPool<T>>,
}

impl<T: Transport> PooledConnection<T> {
   pub(crate) fn new(conn: FiberedConnection<T>, owner: OwnerId, pool: Arc<SharedPool<T>>) -> Self {
      Self {
         conn: Some(conn),
         owner,
         pool,
      }
   }

   fn conn_mut(&mut self) -> &mut FiberedConnection<T> {
      self.conn.as_mut().expect("connection already released")
   }

   /// The reservation this guard represents.
   pub fn owner(&self) -> OwnerId {
      self.owner
   }

   pub fn connection_id(&self) -> ConnectionId {
      self.id()
   }

   /// Run a query on this connection, honouring the pool's query timeout.
   pub async fn execute(&mut self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      let timeout = self.pool.config.query_timeout;
      Ok(self.conn_mut().try_execute(sql, params, timeout).await?)
   }

   /// Broadcast `command` to the pool, applying it to this connection right away.
   pub fn broadcast(&mut self, command: AdminCommand) -> Result<BroadcastReceipt> {
      let pool = Arc::clone(&self.pool);
      pool.broadcast(command, Some(self.conn_mut()))
   }

   /// Return the connection to the pool now.
   pub fn release(self) {
      drop(self);
   }
}

impl<T: Transport> Drop for PooledConnection<T> {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         trace!(connection = %conn.id(), owner = %self.owner, "Releasing connection");
         self.pool.release(conn);
      }
   }
}

impl<T: Transport> fmt::Debug for PooledConnection<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PooledConnection")
         .field("connection", &self.conn.as_ref().map(FiberedConnection::id))
         .field("owner", &self.owner)
         .finish()
   }
}

impl<T: Transport> Deref for PooledConnection<T> {
   type Target = FiberedConnection<T>;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection already released")
   }
}

impl<T: Transport> DerefMut for PooledConnection<T> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn_mut()
   }
}
