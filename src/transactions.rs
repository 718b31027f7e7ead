//! Transactions pinned to one pooled connection

use fibered_pg_conn::{AdminCommand, ConnectionId, PostponedOperation, Transport};
use fibered_pg_pool::PooledConnection;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{Error, Result};

/// An open transaction holding its connection until it finishes.
///
/// Dropping an unfinished transaction queues a `ROLLBACK` on the connection.
/// The rollback runs while the connection is being released, before anybody
/// else can check it out.
#[must_use = "if unused, the transaction is immediately rolled back"]
pub struct Transaction<T: Transport> {
   conn: Option<PooledConnection<T>>,
}

impl<T: Transport> Transaction<T> {
   /// Issue `BEGIN` on `conn`. The connection is released if that fails.
   pub async fn begin(mut conn: PooledConnection<T>) -> Result<Self> {
      conn.execute("BEGIN", &[]).await?;
      debug!(connection = %conn.connection_id(), "Transaction started");
      Ok(Self { conn: Some(conn) })
   }

   fn conn_mut(&mut self) -> Result<&mut PooledConnection<T>> {
      self.conn.as_mut().ok_or(Error::TransactionAlreadyFinalized)
   }

   pub fn connection_id(&self) -> Option<ConnectionId> {
      self.conn.as_ref().map(PooledConnection::connection_id)
   }

   /// Execute a statement inside this transaction
   pub async fn execute(&mut self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      Ok(self.conn_mut()?.execute(sql, params).await?)
   }

   /// Commit this transaction
   pub async fn commit(mut self) -> Result<()> {
      self.finish("COMMIT").await
   }

   /// Rollback this transaction
   pub async fn rollback(mut self) -> Result<()> {
      self.finish("ROLLBACK").await
   }

   async fn finish(&mut self, sql: &str) -> Result<()> {
      let mut conn = self.conn.take().ok_or(Error::TransactionAlreadyFinalized)?;
      match conn.execute(sql, &[]).await {
         Ok(_) => {
            debug!(connection = %conn.connection_id(), statement = sql, "Transaction finished");
            Ok(())
         }
         Err(e) => {
            // The server may still be inside the transaction (e.g. the
            // statement timed out), so make sure the next owner is not.
            postpone_rollback(&conn);
            Err(e.into())
         }
      }
   }
}

fn postpone_rollback<T: Transport>(conn: &PooledConnection<T>) {
   conn.shared()
      .postpone(PostponedOperation::new(AdminCommand::session("ROLLBACK")));
}

impl<T: Transport> Drop for Transaction<T> {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         debug!(
            connection = %conn.connection_id(),
            "Dropping unfinished transaction (will roll back on release)"
         );
         postpone_rollback(&conn);
      }
   }
}
