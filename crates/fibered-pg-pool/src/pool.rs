//! Fixed-size pool of fibered connections

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use fibered_pg_conn::{
   AdminCommand, ConnectionId, ConnectionShared, DriverResult, FiberedConnection,
   PostponedOperation, PostponedReport, Transport, reactor_running,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::broadcast::{BroadcastReceipt, PendingApplication};
use crate::config::PoolConfig;
use crate::guard::PooledConnection;
use crate::stream::{PostponedFailure, PostponedFailureStream};
use crate::{Error, Result};

/// Identity of one reservation. Every successful acquire gets a new owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "owner#{}", self.0)
   }
}

/// Point-in-time view of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStatus {
   /// Total connections, constant for the pool's lifetime
   pub size: usize,
   /// Connections nobody holds
   pub idle: usize,
   /// Connections held by a caller (including ones being handed over)
   pub reserved: usize,
   /// Callers suspended in `acquire`
   pub waiting: usize,
}

/// A caller suspended in `acquire`.
struct Waiter<T: Transport> {
   id: u64,
   owner: OwnerId,
   tx: oneshot::Sender<FiberedConnection<T>>,
}

struct PoolState<T: Transport> {
   idle: VecDeque<FiberedConnection<T>>,
   reserved: HashMap<ConnectionId, OwnerId>,
   waiters: VecDeque<Waiter<T>>,
   next_owner: u64,
   next_waiter: u64,
}

impl<T: Transport> PoolState<T> {
   fn new_owner(&mut self) -> OwnerId {
      self.next_owner += 1;
      OwnerId(self.next_owner)
   }
}

/// State shared by a pool and every connection checked out of it.
///
/// The bookkeeping mutex is never held across an `.await`: each critical
/// section runs to completion before the holder can be suspended.
pub(crate) struct SharedPool<T: Transport> {
   pub(crate) config: PoolConfig,
   members: Vec<Arc<ConnectionShared>>,
   state: Mutex<PoolState<T>>,
   failures: broadcast::Sender<PostponedFailure>,
}

impl<T: Transport> SharedPool<T> {
   /// Return a connection: drain its postponed commands, then hand it to the
   /// longest waiting caller or put it back in the idle set.
   pub(crate) fn release(&self, mut conn: FiberedConnection<T>) {
      let id = conn.id();
      let mut state = self.state.lock();

      // The last owner may have stopped waiting for its query
      conn.cancel_in_flight();
      let report = conn.run_postponed();
      state.reserved.remove(&id);
      self.publish_failures(id, report);

      while let Some(waiter) = state.waiters.pop_front() {
         state.reserved.insert(id, waiter.owner);
         match waiter.tx.send(conn) {
            Ok(()) => {
               debug!(connection = %id, owner = %waiter.owner, "Handed connection to waiting caller");
               return;
            }
            Err(returned) => {
               // Waiter gave up between queueing and now
               state.reserved.remove(&id);
               conn = returned;
            }
         }
      }

      state.idle.push_back(conn);
      trace!(connection = %id, idle = state.idle.len(), "Connection returned to idle set");
   }

   /// Apply `command` to idle connections (and `held`) now, postpone it on the rest.
   pub(crate) fn broadcast(
      &self,
      command: AdminCommand,
      held: Option<&mut FiberedConnection<T>>,
   ) -> Result<BroadcastReceipt> {
      let mut applied = Vec::new();
      let mut failed = Vec::new();
      let mut pending = Vec::new();
      let mut record = |id: ConnectionId, outcome: DriverResult<()>| match outcome {
         Ok(()) => applied.push(id),
         Err(e) => {
            warn!(connection = %id, command = command.label(), error = %e, "Broadcast command failed");
            failed.push((id, e));
         }
      };

      let mut state = self.state.lock();

      let held_id = match held {
         Some(conn) => {
            record(conn.id(), conn.apply(&command));
            Some(conn.id())
         }
         None => None,
      };

      for conn in state.idle.iter_mut() {
         record(conn.id(), conn.apply(&command));
      }

      for member in &self.members {
         let id = member.id();
         if Some(id) == held_id || !state.reserved.contains_key(&id) {
            continue;
         }
         let (op, completion) = PostponedOperation::with_completion(command.clone());
         member.postpone(op);
         pending.push(PendingApplication::new(id, completion));
      }

      drop(state);

      debug!(
         command = command.label(),
         applied = applied.len(),
         postponed = pending.len(),
         failed = failed.len(),
         "Broadcast command"
      );

      if failed.is_empty() {
         return Ok(BroadcastReceipt::new(command, applied, pending));
      }

      let postponed = (!pending.is_empty())
         .then(|| BroadcastReceipt::new(command.clone(), applied.clone(), pending));
      Err(Error::BroadcastPartialFailure {
         command,
         failed,
         applied: applied.len(),
         postponed,
      })
   }

   fn publish_failures(&self, id: ConnectionId, report: PostponedReport) {
      for (command, error) in report.failed {
         // No subscribers is fine; the failure was already logged
         let _ = self.failures.send(PostponedFailure {
            connection: id,
            command,
            error,
            timestamp: Instant::now(),
         });
      }
   }

   fn withdraw_waiter(&self, waiter_id: u64) -> bool {
      let mut state = self.state.lock();
      match state.waiters.iter().position(|w| w.id == waiter_id) {
         Some(pos) => {
            state.waiters.remove(pos);
            true
         }
         None => false,
      }
   }
}

/// An `acquire` call suspended until a release hands it a connection.
///
/// Dropping it (timeout or cancellation) removes the waiter from the queue, or,
/// when a connection was already handed over, releases that connection again.
struct PendingAcquire<T: Transport> {
   shared: Arc<SharedPool<T>>,
   waiter_id: u64,
   rx: oneshot::Receiver<FiberedConnection<T>>,
   settled: bool,
}

impl<T: Transport> PendingAcquire<T> {
   async fn wait(&mut self) -> Result<FiberedConnection<T>> {
      let conn = (&mut self.rx).await.map_err(|_| Error::HandoffLost)?;
      self.settled = true;
      Ok(conn)
   }

   /// Leave the queue. Returns the connection if one was handed over first.
   fn abandon(&mut self) -> Option<FiberedConnection<T>> {
      self.settled = true;
      if self.shared.withdraw_waiter(self.waiter_id) {
         return None;
      }
      // Hand-offs happen under the pool lock, so once the waiter is gone from
      // the queue the connection is already in the channel.
      self.rx.try_recv().ok()
   }
}

impl<T: Transport> Drop for PendingAcquire<T> {
   fn drop(&mut self) {
      if self.settled {
         return;
      }
      if let Some(conn) = self.abandon() {
         debug!(connection = %conn.id(), "Acquire cancelled after hand-off, releasing connection");
         self.shared.release(conn);
      }
   }
}

/// A fixed-size pool of fibered connections.
///
/// ## Checkout discipline
///
/// - **[`acquire`](Pool::acquire)**: returns an idle connection right away, or
///   suspends the caller until one is released. Waiters are served first in,
///   first out, and a released connection goes straight to the longest waiting
///   caller without passing through the idle set.
/// - **[`PooledConnection`]**: the guard returned by `acquire`. Dropping it
///   releases the connection, on every exit path.
///
/// ## Administrative commands
///
/// [`broadcast`](Pool::broadcast) applies a command to every idle connection
/// immediately and postpones it on connections that are checked out. Postponed
/// commands run, oldest first, when the connection is released and before
/// anyone else can use it.
///
/// ## Quoting
///
/// Quoting only needs session metadata, so [`quote`](Pool::quote) and friends
/// read it from any member connection without reserving it. They never wait,
/// even when every connection is checked out.
pub struct Pool<T: Transport> {
   shared: Arc<SharedPool<T>>,
}

impl<T: Transport> Clone for Pool<T> {
   fn clone(&self) -> Self {
      Self {
         shared: Arc::clone(&self.shared),
      }
   }
}

impl<T: Transport> Pool<T> {
   /// Open `config.size` connections using `factory` and build a pool from them.
   ///
   /// The factory is called once per connection, in id order, before the pool
   /// is returned. The set of connections never changes afterwards.
   pub fn connect<F>(config: PoolConfig, mut factory: F) -> Result<Self>
   where
      F: FnMut(ConnectionId) -> DriverResult<T>,
   {
      config.validate()?;

      let mut idle = VecDeque::with_capacity(config.size);
      let mut members = Vec::with_capacity(config.size);
      for n in 0..config.size {
         let id = ConnectionId(n);
         let transport = factory(id).map_err(|source| Error::Connect { id, source })?;
         let conn = FiberedConnection::new(id, transport);
         members.push(Arc::clone(conn.shared()));
         idle.push_back(conn);
      }

      let (failures, _) = broadcast::channel(config.failure_channel_capacity.max(1));
      debug!(size = config.size, "Connection pool ready");

      Ok(Self {
         shared: Arc::new(SharedPool {
            config,
            members,
            state: Mutex::new(PoolState {
               idle,
               reserved: HashMap::new(),
               waiters: VecDeque::new(),
               next_owner: 0,
               next_waiter: 0,
            }),
            failures,
         }),
      })
   }

   pub fn config(&self) -> &PoolConfig {
      &self.shared.config
   }

   /// Number of connections in the pool.
   pub fn size(&self) -> usize {
      self.shared.members.len()
   }

   pub fn status(&self) -> PoolStatus {
      let state = self.shared.state.lock();
      PoolStatus {
         size: self.shared.members.len(),
         idle: state.idle.len(),
         reserved: state.reserved.len(),
         waiting: state.waiters.len(),
      }
   }

   /// Check out a connection, waiting for one to be released if necessary.
   ///
   /// With an `acquire_timeout` configured (and a Tokio runtime running), fails
   /// with [`Error::PoolExhausted`] when nothing is released in time.
   pub async fn acquire(&self) -> Result<PooledConnection<T>> {
      let (owner, waiter_id, rx) = {
         let mut state = self.shared.state.lock();
         let owner = state.new_owner();

         if let Some(conn) = state.idle.pop_front() {
            state.reserved.insert(conn.id(), owner);
            trace!(connection = %conn.id(), %owner, "Acquired idle connection");
            return Ok(PooledConnection::new(conn, owner, Arc::clone(&self.shared)));
         }

         let (tx, rx) = oneshot::channel();
         let waiter_id = state.next_waiter;
         state.next_waiter += 1;
         state.waiters.push_back(Waiter {
            id: waiter_id,
            owner,
            tx,
         });
         debug!(%owner, waiting = state.waiters.len(), "No idle connection, waiting for a release");
         (owner, waiter_id, rx)
      };

      let mut pending = PendingAcquire {
         shared: Arc::clone(&self.shared),
         waiter_id,
         rx,
         settled: false,
      };

      let limit = self
         .shared
         .config
         .acquire_timeout
         .filter(|_| reactor_running());

      let conn = match limit {
         None => pending.wait().await?,
         Some(limit) => {
            let outcome = tokio::time::timeout(limit, pending.wait()).await;
            match outcome {
               Ok(conn) => conn?,
               Err(_) => match pending.abandon() {
                  // Released right as the timer fired; keep it
                  Some(conn) => conn,
                  None => {
                     warn!(%owner, waited = ?limit, "Timed out waiting for a connection");
                     return Err(Error::PoolExhausted { waited: limit });
                  }
               },
            }
         }
      };

      trace!(connection = %conn.id(), %owner, "Acquired connection from hand-off");
      Ok(PooledConnection::new(conn, owner, Arc::clone(&self.shared)))
   }

   /// Check out an idle connection without waiting.
   pub fn try_acquire(&self) -> Option<PooledConnection<T>> {
      let mut state = self.shared.state.lock();
      let conn = state.idle.pop_front()?;
      let owner = state.new_owner();
      state.reserved.insert(conn.id(), owner);
      Some(PooledConnection::new(conn, owner, Arc::clone(&self.shared)))
   }

   /// Give a connection back. Same as dropping the guard.
   pub fn release(&self, conn: PooledConnection<T>) {
      drop(conn);
   }

   /// Run one query on whichever connection is available.
   ///
   /// The connection is released whether the query succeeds or fails.
   pub async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      let mut conn = self.acquire().await?;
      conn.execute(sql, params).await
   }

   /// Apply `command` to every connection in the pool.
   ///
   /// Idle connections run it now. Checked-out connections run it when they are
   /// released; use [`BroadcastReceipt::wait`] to wait for them. To include
   /// the caller's own connection in the immediate part, broadcast through
   /// [`PooledConnection::broadcast`] instead.
   ///
   /// When an immediate application fails the call returns
   /// [`Error::BroadcastPartialFailure`], but the command stays queued on the
   /// checked-out connections. Its `postponed` receipt waits for those, and
   /// their failures also reach [`Pool::subscribe_failures`].
   pub fn broadcast(&self, command: AdminCommand) -> Result<BroadcastReceipt> {
      self.shared.broadcast(command, None)
   }

   /// Subscribe to failures of postponed commands.
   pub fn subscribe_failures(&self) -> PostponedFailureStream {
      PostponedFailureStream::new(self.shared.failures.subscribe())
   }

   /// Run `f` against a member connection without reserving it.
   ///
   /// Prefers an idle connection and falls back to a checked-out one. Only the
   /// connection's local state is reachable through [`ConnectionShared`].
   pub fn any_connection_for<R>(&self, f: impl FnOnce(&ConnectionShared) -> R) -> R {
      let member = {
         let state = self.shared.state.lock();
         match state.idle.front() {
            Some(conn) => Arc::clone(conn.shared()),
            None => {
               let id = state
                  .reserved
                  .keys()
                  .min()
                  .copied()
                  .unwrap_or(ConnectionId(0));
               Arc::clone(&self.shared.members[id.0])
            }
         }
      };
      f(&member)
   }

   /// Render a value as an SQL literal.
   pub fn quote(&self, value: &JsonValue) -> String {
      self.any_connection_for(|c| c.session().quote(value))
   }

   pub fn quote_string(&self, s: &str) -> String {
      self.any_connection_for(|c| c.session().quote_string(s))
   }

   pub fn escape_string(&self, s: &str) -> String {
      self.any_connection_for(|c| c.session().escape_string(s))
   }

   pub fn quote_identifier(&self, name: &str) -> String {
      self.any_connection_for(|c| c.session().quote_identifier(name))
   }

   pub fn quote_table_name(&self, name: &str) -> String {
      self.any_connection_for(|c| c.session().quote_table_name(name))
   }

   pub fn quote_column_name(&self, name: &str) -> String {
      self.quote_identifier(name)
   }

   pub fn escape_bytea(&self, bytes: &[u8]) -> String {
      self.any_connection_for(|c| c.session().escape_bytea(bytes))
   }

   pub fn unescape_bytea(&self, text: &str) -> Result<Vec<u8>> {
      Ok(self.any_connection_for(|c| c.session().unescape_bytea(text))?)
   }
}
