//! A physical connection whose queries suspend the caller instead of the thread

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

use crate::error::{DriverResult, Error, Result};
use crate::postponed::{PostponedOperation, PostponedQueue, PostponedReport};
use crate::session::SessionInfo;
use crate::transport::{AdminCommand, Transport};
#[cfg(unix)]
use crate::watcher::{ReadinessWatcher, WatchLedger, WatchStats};

/// Stable identity of a connection within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "conn#{}", self.0)
   }
}

/// Returns true when called from inside a Tokio runtime.
///
/// This is what decides between suspending on readiness and blocking on the
/// synchronous fallback.
pub fn reactor_running() -> bool {
   tokio::runtime::Handle::try_current().is_ok()
}

/// The part of a connection its pool keeps while somebody else holds it.
///
/// Only local state lives here: the postponed queue and the session metadata.
/// Nothing reachable from this handle touches the network.
#[derive(Debug)]
pub struct ConnectionShared {
   id: ConnectionId,
   session: SessionInfo,
   postponed: PostponedQueue,
}

impl ConnectionShared {
   pub fn id(&self) -> ConnectionId {
      self.id
   }

   pub fn session(&self) -> &SessionInfo {
      &self.session
   }

   /// Queue `op` to run the next time the connection is released.
   ///
   /// Never runs anything immediately, whatever state the connection is in.
   pub fn postpone(&self, op: PostponedOperation) {
      trace!(connection = %self.id, command = op.command().label(), "Command postponed");
      self.postponed.push(op);
   }

   /// Number of operations waiting for the next release.
   pub fn postponed_len(&self) -> usize {
      self.postponed.len()
   }
}

/// One physical connection that can run queries without blocking the event loop.
///
/// ## Query paths
///
/// - **Suspending**: inside a Tokio runtime, the query is dispatched, the
///   socket is registered for readiness and the calling task is suspended
///   until the result can be fetched.
/// - **Blocking**: outside a runtime, the transport runs the query synchronously.
///
/// ## Postponed commands
///
/// Administrative commands that arrive while the connection is checked out are
/// queued on [`ConnectionShared`] and applied by [`FiberedConnection::run_postponed`]
/// in arrival order (first in, first out).
///
/// ## Abandoned queries
///
/// A suspended query whose future is dropped before the result is fetched
/// stays in flight on the transport. It is cancelled by the next query on this
/// connection or by [`FiberedConnection::cancel_in_flight`], whichever comes first.
pub struct FiberedConnection<T: Transport> {
   transport: T,
   shared: Arc<ConnectionShared>,
   in_flight: bool,
   #[cfg(unix)]
   watches: WatchLedger,
}

impl<T: Transport> fmt::Debug for FiberedConnection<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("FiberedConnection")
         .field("id", &self.shared.id)
         .field("postponed", &self.shared.postponed_len())
         .field("in_flight", &self.in_flight)
         .finish_non_exhaustive()
   }
}

impl<T: Transport> FiberedConnection<T> {
   pub fn new(id: ConnectionId, transport: T) -> Self {
      let shared = Arc::new(ConnectionShared {
         id,
         session: transport.session(),
         postponed: PostponedQueue::default(),
      });

      Self {
         transport,
         shared,
         in_flight: false,
         #[cfg(unix)]
         watches: WatchLedger::default(),
      }
   }

   pub fn id(&self) -> ConnectionId {
      self.shared.id
   }

   pub fn session(&self) -> &SessionInfo {
      &self.shared.session
   }

   /// Handle the pool keeps to postpone commands and read session metadata.
   pub fn shared(&self) -> &Arc<ConnectionShared> {
      &self.shared
   }

   pub fn transport(&self) -> &T {
      &self.transport
   }

   pub fn transport_mut(&mut self) -> &mut T {
      &mut self.transport
   }

   /// True while a dispatched query has not been fetched or cancelled.
   pub fn has_query_in_flight(&self) -> bool {
      self.in_flight
   }

   /// Cancel a query left in flight by a caller that stopped waiting for it.
   ///
   /// Returns whether there was one. A failing cancel is logged, the
   /// connection is considered idle afterwards either way.
   pub fn cancel_in_flight(&mut self) -> bool {
      if !self.in_flight {
         return false;
      }
      self.in_flight = false;

      if let Err(e) = self.transport.cancel() {
         warn!(connection = %self.shared.id, error = %e, "Failed to cancel abandoned query");
      } else {
         debug!(connection = %self.shared.id, "Cancelled abandoned query");
      }
      true
   }

   /// Readiness registrations made by this connection so far.
   #[cfg(unix)]
   pub fn readiness_watches(&self) -> WatchStats {
      self.watches.stats()
   }

   /// Run a query, suspending the calling task until the socket is readable.
   ///
   /// Must be called from inside a Tokio runtime with IO enabled; returns
   /// [`Error::NoEventLoop`] otherwise. With a `timeout`, the in-flight query is
   /// cancelled and [`Error::QueryTimeout`] returned when no result arrives in time.
   #[cfg(unix)]
   pub async fn execute_async(
      &mut self,
      sql: &str,
      params: &[JsonValue],
      timeout: Option<Duration>,
   ) -> Result<T::Output> {
      if !reactor_running() {
         return Err(Error::NoEventLoop);
      }
      self.cancel_in_flight();

      self.transport.dispatch(sql, params)?;
      self.in_flight = true;

      // The registration result borrows the watch ledger, so a failure
      // leaves the block before the connection is touched again.
      let registration_error = 'register: {
         let watcher = match ReadinessWatcher::register(self.transport.socket(), &self.watches) {
            Ok(watcher) => watcher,
            Err(e) => break 'register e,
         };
         trace!(connection = %self.shared.id, "Query dispatched, waiting for readiness");

         let transport = &mut self.transport;
         let in_flight = &mut self.in_flight;
         let completion = watcher.notify_readable(|| {
            *in_flight = false;
            transport.fetch_result()
         });

         let outcome = match timeout {
            None => completion.await,
            Some(limit) => match tokio::time::timeout(limit, completion).await {
               Ok(result) => result,
               Err(_) => {
                  warn!(connection = %self.shared.id, timeout = ?limit, "Query timed out, cancelling");
                  Err(Error::QueryTimeout(limit))
               }
            },
         };

         // Timed out, or readiness failed before the result could be fetched
         self.cancel_in_flight();
         return outcome;
      };
      warn!(connection = %self.shared.id, error = %registration_error, "Readiness registration failed");
      self.cancel_in_flight();
      Err(registration_error.into())
   }

   /// Run a query the best way available: suspending inside a runtime,
   /// blocking outside of one.
   pub async fn try_execute(
      &mut self,
      sql: &str,
      params: &[JsonValue],
      timeout: Option<Duration>,
   ) -> Result<T::Output> {
      #[cfg(unix)]
      if reactor_running() {
         return self.execute_async(sql, params, timeout).await;
      }

      #[cfg(not(unix))]
      let _ = timeout;

      self.execute_sync(sql, params)
   }

   /// Run a query on the synchronous fallback path.
   pub fn execute_sync(&mut self, sql: &str, params: &[JsonValue]) -> Result<T::Output> {
      self.cancel_in_flight();
      Ok(self.transport.execute_sync(sql, params)?)
   }

   /// Apply an administrative command right away.
   pub fn apply(&mut self, command: &AdminCommand) -> DriverResult<()> {
      self.cancel_in_flight();
      self.transport.apply(command)
   }

   /// Queue `op` for the next release. See [`ConnectionShared::postpone`].
   pub fn postpone(&self, op: PostponedOperation) {
      self.shared.postpone(op);
   }

   /// Apply every postponed command, oldest first.
   ///
   /// A failing command does not stop the drain: each outcome goes to that
   /// operation's completion and into the returned report.
   pub fn run_postponed(&mut self) -> PostponedReport {
      let mut report = PostponedReport::default();
      self.cancel_in_flight();

      for op in self.shared.postponed.take_all() {
         let command = op.command().clone();
         match self.transport.apply(&command) {
            Ok(()) => {
               op.complete(Ok(()));
               report.applied.push(command);
            }
            Err(e) => {
               warn!(
                  connection = %self.shared.id,
                  command = command.label(),
                  error = %e,
                  "Postponed command failed"
               );
               op.complete(Err(e.clone()));
               report.failed.push((command, e));
            }
         }
      }

      if !report.is_empty() {
         debug!(
            connection = %self.shared.id,
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Ran postponed commands"
         );
      }

      report
   }
}

#[cfg(all(test, unix))]
mod tests {
   use super::*;
   use crate::testing::{ScriptedBackend, ScriptedResult, TransportEvent};
   use serde_json::json;

   fn connection(backend: &ScriptedBackend) -> FiberedConnection<crate::testing::ScriptedTransport> {
      FiberedConnection::new(ConnectionId(0), backend.connect().unwrap())
   }

   #[tokio::test]
   async fn test_execute_async_returns_raw_result() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let result = conn
         .execute_async("SELECT $1", &[json!(7)], None)
         .await
         .unwrap();

      assert_eq!(
         result,
         ScriptedResult {
            connection: 0,
            sql: "SELECT $1".into(),
            params: vec![json!(7)],
         }
      );
      assert_eq!(
         backend.probe(0).events(),
         vec![
            TransportEvent::Dispatched("SELECT $1".into()),
            TransportEvent::Fetched("SELECT $1".into()),
         ]
      );
   }

   #[tokio::test]
   async fn test_execute_async_surfaces_driver_error() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let err = conn
         .execute_async("FAIL relation does not exist", &[], None)
         .await
         .unwrap_err();

      let driver = err.as_driver_error().expect("driver error");
      assert_eq!(driver.message(), "relation does not exist");
      assert_eq!(driver.sqlstate(), Some("XX000"));
   }

   #[tokio::test]
   async fn test_one_watch_per_query_even_on_failure() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      conn.execute_async("SELECT 1", &[], None).await.unwrap();
      conn.execute_async("FAIL nope", &[], None).await.unwrap_err();
      conn.execute_async("SLEEP 10 SELECT 2", &[], None).await.unwrap();

      let stats = conn.readiness_watches();
      assert_eq!(stats.registered, 3);
      assert_eq!(stats.outstanding(), 0);
   }

   #[tokio::test]
   async fn test_query_timeout_releases_watch_and_cancels() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let err = conn
         .execute_async("HANG", &[], Some(Duration::from_millis(20)))
         .await
         .unwrap_err();

      assert!(matches!(err, Error::QueryTimeout(_)));
      assert_eq!(conn.readiness_watches().outstanding(), 0);
      assert_eq!(backend.probe(0).in_flight(), 0);
      assert!(backend.probe(0).events().contains(&TransportEvent::Cancelled));

      // The connection is usable again afterwards
      let result = conn.execute_async("SELECT 1", &[], None).await.unwrap();
      assert_eq!(result.sql, "SELECT 1");
   }

   #[tokio::test]
   async fn test_dropped_query_is_cancelled_by_next_query() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let dropped = tokio::time::timeout(
         Duration::from_millis(20),
         conn.execute_async("SLEEP 200 SELECT 1", &[], None),
      )
      .await;
      assert!(dropped.is_err());
      assert!(conn.has_query_in_flight());
      assert_eq!(conn.readiness_watches().outstanding(), 0);

      let result = conn.execute_async("SELECT 2", &[], None).await.unwrap();
      assert_eq!(result.sql, "SELECT 2");
      assert!(!conn.has_query_in_flight());
      assert_eq!(backend.probe(0).in_flight(), 0);
      assert_eq!(
         backend.probe(0).events(),
         vec![
            TransportEvent::Dispatched("SLEEP 200 SELECT 1".into()),
            TransportEvent::Cancelled,
            TransportEvent::Dispatched("SELECT 2".into()),
            TransportEvent::Fetched("SELECT 2".into()),
         ]
      );
   }

   #[tokio::test]
   async fn test_cancel_in_flight_only_when_needed() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      assert!(!conn.cancel_in_flight());
      assert!(backend.probe(0).events().is_empty());

      let _ = tokio::time::timeout(
         Duration::from_millis(10),
         conn.execute_async("HANG", &[], None),
      )
      .await;
      assert!(conn.cancel_in_flight());
      assert!(!conn.cancel_in_flight());
      assert_eq!(backend.probe(0).in_flight(), 0);
   }

   #[tokio::test]
   async fn test_registration_failure_cancels_dispatched_query() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);
      backend.probe(0).detach_socket(true);

      let err = conn.execute_async("SELECT 1", &[], None).await.unwrap_err();
      assert!(matches!(err, Error::Io(_)));
      assert!(!conn.has_query_in_flight());
      assert_eq!(conn.readiness_watches().registered, 0);
      assert_eq!(backend.probe(0).in_flight(), 0);

      backend.probe(0).detach_socket(false);
      let result = conn.execute_async("SELECT 2", &[], None).await.unwrap();
      assert_eq!(result.sql, "SELECT 2");
   }

   #[test]
   fn test_execute_async_requires_event_loop() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let err = futures::executor::block_on(conn.execute_async("SELECT 1", &[], None)).unwrap_err();
      assert!(matches!(err, Error::NoEventLoop));
      assert!(backend.probe(0).events().is_empty());
   }

   #[test]
   fn test_try_execute_falls_back_to_sync_outside_runtime() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      let result = futures::executor::block_on(conn.try_execute("SELECT 1", &[], None)).unwrap();
      assert_eq!(result.sql, "SELECT 1");
      assert_eq!(
         backend.probe(0).events(),
         vec![TransportEvent::Sync("SELECT 1".into())]
      );
      assert_eq!(conn.readiness_watches().registered, 0);
   }

   #[tokio::test]
   async fn test_try_execute_suspends_inside_runtime() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);

      conn.try_execute("SELECT 1", &[], None).await.unwrap();
      assert_eq!(conn.readiness_watches().registered, 1);
   }

   #[test]
   fn test_postpone_never_runs_immediately() {
      let backend = ScriptedBackend::new();
      let conn = connection(&backend);

      conn.postpone(PostponedOperation::new(AdminCommand::prepare("s1", "SELECT 1")));
      assert_eq!(conn.shared().postponed_len(), 1);
      assert!(backend.probe(0).applied().is_empty());
   }

   #[test]
   fn test_run_postponed_is_fifo() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);
      let op1 = AdminCommand::prepare("op1", "SELECT 1");
      let op2 = AdminCommand::prepare("op2", "SELECT 2");

      conn.postpone(PostponedOperation::new(op1.clone()));
      conn.postpone(PostponedOperation::new(op2.clone()));
      let report = conn.run_postponed();

      assert_eq!(report.applied, vec![op1.clone(), op2.clone()]);
      assert_eq!(backend.probe(0).applied(), vec![op1, op2]);
      assert_eq!(conn.shared().postponed_len(), 0);
   }

   #[test]
   fn test_run_postponed_continues_after_failure() {
      let backend = ScriptedBackend::new();
      let mut conn = connection(&backend);
      let bad = AdminCommand::session("FAIL SET nonsense");
      let good = AdminCommand::session("SET search_path TO app");

      let (bad_op, bad_done) = PostponedOperation::with_completion(bad.clone());
      let (good_op, good_done) = PostponedOperation::with_completion(good.clone());
      conn.postpone(bad_op);
      conn.postpone(good_op);

      let report = conn.run_postponed();
      assert_eq!(report.applied, vec![good.clone()]);
      assert_eq!(report.failed.len(), 1);
      assert_eq!(report.failed[0].0, bad);

      let mut bad_done = bad_done;
      let mut good_done = good_done;
      assert!(bad_done.try_recv().unwrap().is_err());
      assert!(good_done.try_recv().unwrap().is_ok());
   }
}
