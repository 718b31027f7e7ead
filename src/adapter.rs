use fibered_pg_conn::{AdminCommand, ConnectionId, DriverResult, Transport};
use fibered_pg_pool::{
   BroadcastReceipt, Pool, PoolStatus, PooledConnection, PostponedFailureStream,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::bootstrap::bootstrap_session;
use crate::config::{AdapterConfig, ConnectOptions};
use crate::transactions::Transaction;
use crate::{Error, Result};

/// Name the adapter reports about itself.
pub const ADAPTER_NAME: &str = "FiberedPostgreSQL";

/// First server version (8.3) with the 19-digit `money` type.
const WIDE_MONEY_SERVER_VERSION: u32 = 80_300;

/// Opens driver transports for the adapter's pool.
///
/// Implemented for any `FnMut(ConnectionId, &ConnectOptions) -> DriverResult<T>`.
pub trait Connector<T: Transport> {
   fn connect(&mut self, id: ConnectionId, options: &ConnectOptions) -> DriverResult<T>;
}

impl<T, F> Connector<T> for F
where
   T: Transport,
   F: FnMut(ConnectionId, &ConnectOptions) -> DriverResult<T>,
{
   fn connect(&mut self, id: ConnectionId, options: &ConnectOptions) -> DriverResult<T> {
      self(id, options)
   }
}

/// Database adapter backed by a pool of fibered connections.
pub struct Adapter<T: Transport> {
   pool: Pool<T>,
   config: AdapterConfig,
}

impl<T: Transport> Adapter<T> {
   /// Validate `config`, open the whole pool through `connector` and set up
   /// every session.
   ///
   /// Fails if any connection cannot be opened or configured.
   pub fn establish<C>(config: AdapterConfig, mut connector: C) -> Result<Self>
   where
      C: Connector<T>,
   {
      config.validate()?;
      let options = config.connect_options()?;
      let settings = config.session_settings();

      let pool = Pool::connect(config.pool_config(), |id| {
         let mut transport = connector.connect(id, &options)?;
         bootstrap_session(&mut transport, &settings)?;
         debug!(connection = %id, database = %options.database, "Connection configured");
         Ok(transport)
      })?;

      Ok(Self { pool, config })
   }

   pub fn adapter_name(&self) -> &'static str {
      ADAPTER_NAME
   }

   pub fn config(&self) -> &AdapterConfig {
      &self.config
   }

   pub fn pool(&self) -> &Pool<T> {
      &self.pool
   }

   pub fn status(&self) -> PoolStatus {
      self.pool.status()
   }

   /// Run a query on any available connection, suspending until it completes.
   pub async fn async_exec(&self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      Ok(self.pool.execute(sql, params).await?)
   }

   /// Same as [`async_exec`](Adapter::async_exec).
   pub async fn async_query(&self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      self.async_exec(sql, params).await
   }

   /// Prepare a named statement on every connection in the pool.
   ///
   /// Returns `None` without touching any connection when prepared statements
   /// are disabled in the configuration.
   pub fn prepare(&self, name: &str, sql: &str) -> Result<Option<BroadcastReceipt>> {
      if !self.config.prepared_statements {
         debug!(statement = name, "Prepared statements disabled, not preparing");
         return Ok(None);
      }
      Ok(Some(self.pool.broadcast(AdminCommand::prepare(name, sql))?))
   }

   /// Drop a named statement from every connection in the pool.
   pub fn deallocate(&self, name: &str) -> Result<BroadcastReceipt> {
      Ok(self.pool.broadcast(AdminCommand::Deallocate {
         name: name.to_string(),
      })?)
   }

   /// Run a session-level statement (e.g. `SET statement_timeout`) on every
   /// connection in the pool.
   pub fn set_session(&self, sql: &str) -> Result<BroadcastReceipt> {
      Ok(self.pool.broadcast(AdminCommand::session(sql))?)
   }

   /// Subscribe to postponed commands that failed when their connection was released.
   pub fn subscribe_failures(&self) -> PostponedFailureStream {
      self.pool.subscribe_failures()
   }

   pub fn quote(&self, value: &JsonValue) -> String {
      self.pool.quote(value)
   }

   pub fn quote_table_name(&self, name: &str) -> String {
      self.pool.quote_table_name(name)
   }

   pub fn quote_column_name(&self, name: &str) -> String {
      self.pool.quote_column_name(name)
   }

   /// Escape a string for use inside a literal.
   pub fn escape(&self, s: &str) -> String {
      self.pool.escape_string(s)
   }

   pub fn escape_bytea(&self, value: Option<&[u8]>) -> Option<String> {
      value.map(|bytes| self.pool.escape_bytea(bytes))
   }

   pub fn unescape_bytea(&self, value: Option<&str>) -> Result<Option<Vec<u8>>> {
      value
         .map(|text| self.pool.unescape_bytea(text))
         .transpose()
         .map_err(Error::from)
   }

   /// Server version in `PG_VERSION_NUM` form, read without reserving a connection.
   pub fn server_version(&self) -> u32 {
      self.pool.any_connection_for(|c| c.session().server_version)
   }

   /// Digits of precision of the `money` type on this server.
   pub fn money_precision(&self) -> u32 {
      if self.server_version() >= WIDE_MONEY_SERVER_VERSION {
         19
      } else {
         10
      }
   }

   /// Check out a connection for a sequence of queries.
   pub async fn checkout(&self) -> Result<PooledConnection<T>> {
      Ok(self.pool.acquire().await?)
   }

   /// Start a transaction on a freshly checked out connection.
   pub async fn begin(&self) -> Result<Transaction<T>> {
      let conn = self.checkout().await?;
      Transaction::begin(conn).await
   }

   /// Execute multiple statements atomically within a transaction.
   ///
   /// This method:
   /// 1. Begins a transaction (BEGIN)
   /// 2. Executes all statements in order
   /// 3. Commits on success (COMMIT)
   /// 4. Rolls back on any error (ROLLBACK)
   ///
   /// Returns the result of each statement execution.
   pub async fn execute_transaction(
      &self,
      statements: Vec<(String, Vec<JsonValue>)>,
   ) -> Result<Vec<T::Output>> {
      let mut tx = self.begin().await?;

      let mut results = Vec::with_capacity(statements.len());
      let mut failure = None;
      for (sql, params) in &statements {
         match tx.execute(sql, params).await {
            Ok(output) => results.push(output),
            Err(e) => {
               failure = Some(e);
               break;
            }
         }
      }

      match failure {
         None => {
            tx.commit().await?;
            Ok(results)
         }
         Some(e) => match tx.rollback().await {
            // Rollback succeeded, return original error
            Ok(()) => Err(e),

            // Rollback also failed, return the rollback error and the original error
            Err(rollback_err) => Err(Error::TransactionRollbackFailed {
               transaction_error: e.to_string(),
               rollback_error: rollback_err.to_string(),
            }),
         },
      }
   }
}
