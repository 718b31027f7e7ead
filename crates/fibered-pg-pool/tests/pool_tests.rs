#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{setup_pool, setup_sized, wait_until};
use fibered_pg_conn::testing::{ScriptedBackend, TransportEvent};
use fibered_pg_conn::{ConnectionId, DriverError};
use fibered_pg_pool::{Error, Pool, PoolConfig, PoolStatus};
use parking_lot::Mutex;
use serde_json::json;

#[tokio::test]
async fn test_acquire_returns_idle_connection() {
   let t = setup_sized(2);

   let conn = t.pool.acquire().await.unwrap();
   assert_eq!(conn.connection_id(), ConnectionId(0));
   assert_eq!(
      t.pool.status(),
      PoolStatus {
         size: 2,
         idle: 1,
         reserved: 1,
         waiting: 0,
      }
   );

   drop(conn);
   assert_eq!(t.pool.status().idle, 2);
   assert_eq!(t.pool.status().reserved, 0);
}

#[tokio::test]
async fn test_every_acquire_gets_a_new_owner() {
   let t = setup_sized(1);

   let first = t.pool.acquire().await.unwrap().owner();
   let second = t.pool.acquire().await.unwrap().owner();
   assert_ne!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reservations_never_exceed_pool_size() {
   for size in 1..=4 {
      let t = setup_sized(size);
      let active = Arc::new(AtomicUsize::new(0));
      let peak = Arc::new(AtomicUsize::new(0));
      let in_use: Arc<Vec<AtomicBool>> = Arc::new((0..size).map(|_| AtomicBool::new(false)).collect());

      let mut tasks = Vec::new();
      for n in 0..24 {
         let pool = t.pool.clone();
         let active = Arc::clone(&active);
         let peak = Arc::clone(&peak);
         let in_use = Arc::clone(&in_use);
         tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await.unwrap();
            let id = conn.connection_id().0;
            assert!(
               !in_use[id].swap(true, Ordering::SeqCst),
               "conn#{} handed to two callers",
               id
            );

            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.status().reserved <= size);

            let result = conn.execute("SLEEP 2 SELECT $1", &[json!(n)]).await.unwrap();
            assert_eq!(result.connection, id);

            active.fetch_sub(1, Ordering::SeqCst);
            in_use[id].store(false, Ordering::SeqCst);
         }));
      }

      for task in tasks {
         task.await.unwrap();
      }

      assert!(peak.load(Ordering::SeqCst) <= size);
      let status = t.pool.status();
      assert_eq!(status.idle, size);
      assert_eq!(status.reserved, 0);
      assert_eq!(status.waiting, 0);
   }
}

#[tokio::test]
async fn test_concurrent_queries_get_their_own_results() {
   let t = setup_sized(3);

   let mut tasks = Vec::new();
   for n in 0..12 {
      let pool = t.pool.clone();
      tasks.push(tokio::spawn(async move {
         let sql = format!("SLEEP {} SELECT {}", 12 - n, n);
         let result = pool.execute(&sql, &[json!(n), json!("x")]).await.unwrap();
         (sql, n, result)
      }));
   }

   for task in tasks {
      let (sql, n, result) = task.await.unwrap();
      assert_eq!(result.sql, sql);
      assert_eq!(result.params, vec![json!(n), json!("x")]);
   }
}

#[tokio::test]
async fn test_driver_error_is_surfaced_and_connection_released() {
   let t = setup_sized(2);

   let err = t.pool.execute("FAIL relation \"users\" does not exist", &[]).await.unwrap_err();
   match &err {
      Error::Driver(e) => {
         assert_eq!(e.message(), "relation \"users\" does not exist");
         assert_eq!(e.sqlstate(), Some("XX000"));
      }
      other => panic!("expected driver error, got {:?}", other),
   }
   assert_eq!(err.error_code(), "PG_XX000");
   assert_eq!(t.pool.status().idle, 2);

   // The connection is still usable afterwards
   let result = t.pool.execute("SELECT 1", &[]).await.unwrap();
   assert_eq!(result.sql, "SELECT 1");
}

#[tokio::test]
async fn test_release_hands_connection_to_waiter() {
   let t = setup_sized(2);

   let a = t.pool.acquire().await.unwrap();
   let b = t.pool.acquire().await.unwrap();
   let released_id = a.connection_id();

   let pool = t.pool.clone();
   let third = tokio::spawn(async move {
      let conn = pool.acquire().await.unwrap();
      conn.connection_id()
   });

   wait_until(|| t.pool.status().waiting == 1).await;
   assert_eq!(t.pool.status().idle, 0);

   drop(a);
   // Handed over directly, never parked in the idle set
   assert_eq!(
      t.pool.status(),
      PoolStatus {
         size: 2,
         idle: 0,
         reserved: 2,
         waiting: 0,
      }
   );

   assert_eq!(third.await.unwrap(), released_id);
   drop(b);
   assert_eq!(t.pool.status().idle, 2);
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
   let t = setup_sized(1);
   let holder = t.pool.acquire().await.unwrap();
   let order = Arc::new(Mutex::new(Vec::new()));

   let mut tasks = Vec::new();
   for n in 0..4 {
      let pool = t.pool.clone();
      let order = Arc::clone(&order);
      tasks.push(tokio::spawn(async move {
         let _conn = pool.acquire().await.unwrap();
         order.lock().push(n);
      }));
      wait_until(|| t.pool.status().waiting == n + 1).await;
   }

   drop(holder);
   for task in tasks {
      task.await.unwrap();
   }

   assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_acquire_timeout_reports_exhaustion() {
   let t = setup_pool(PoolConfig::new(1).with_acquire_timeout(Duration::from_millis(30)));
   let holder = t.pool.acquire().await.unwrap();

   let err = t.pool.acquire().await.unwrap_err();
   assert!(matches!(err, Error::PoolExhausted { waited } if waited == Duration::from_millis(30)));
   assert_eq!(err.error_code(), "POOL_EXHAUSTED");
   assert_eq!(t.pool.status().waiting, 0);

   drop(holder);
   assert_eq!(t.pool.status().idle, 1);
   let conn = t.pool.acquire().await.unwrap();
   assert_eq!(conn.connection_id(), ConnectionId(0));
}

#[tokio::test]
async fn test_cancelled_acquire_leaves_no_waiter() {
   let t = setup_sized(1);
   let holder = t.pool.acquire().await.unwrap();

   let pool = t.pool.clone();
   let task = tokio::spawn(async move {
      let _conn = pool.acquire().await;
   });
   wait_until(|| t.pool.status().waiting == 1).await;

   task.abort();
   assert!(task.await.unwrap_err().is_cancelled());
   assert_eq!(t.pool.status().waiting, 0);

   drop(holder);
   assert_eq!(
      t.pool.status(),
      PoolStatus {
         size: 1,
         idle: 1,
         reserved: 0,
         waiting: 0,
      }
   );
}

#[tokio::test]
async fn test_cancelled_waiter_is_skipped_on_release() {
   let t = setup_sized(1);
   let holder = t.pool.acquire().await.unwrap();

   let pool = t.pool.clone();
   let abandoned = tokio::spawn(async move {
      let _conn = pool.acquire().await;
   });
   wait_until(|| t.pool.status().waiting == 1).await;

   let pool = t.pool.clone();
   let patient = tokio::spawn(async move { pool.acquire().await.unwrap().connection_id() });
   wait_until(|| t.pool.status().waiting == 2).await;

   abandoned.abort();
   let _ = abandoned.await;
   drop(holder);

   assert_eq!(patient.await.unwrap(), ConnectionId(0));
   assert_eq!(t.pool.status().idle, 1);
}

#[tokio::test]
async fn test_query_timeout_cancels_and_releases() {
   let t = setup_pool(PoolConfig::new(1).with_query_timeout(Duration::from_millis(20)));

   let err = t.pool.execute("HANG", &[]).await.unwrap_err();
   assert!(matches!(err, Error::QueryTimeout(limit) if limit == Duration::from_millis(20)));
   assert_eq!(t.pool.status().idle, 1);

   let probe = t.backend.probe(0);
   assert_eq!(probe.in_flight(), 0);
   assert!(probe.events().contains(&TransportEvent::Cancelled));

   let result = t.pool.execute("SELECT 2", &[]).await.unwrap();
   assert_eq!(result.sql, "SELECT 2");
}

#[tokio::test]
async fn test_abandoned_query_is_cancelled_before_reuse() {
   let t = setup_sized(1);

   // The caller stops waiting long before the server answers
   let abandoned =
      tokio::time::timeout(Duration::from_millis(20), t.pool.execute("SLEEP 300 SELECT 1", &[]))
         .await;
   assert!(abandoned.is_err());
   assert_eq!(t.pool.status().idle, 1);

   let probe = t.backend.probe(0);
   assert_eq!(probe.in_flight(), 0);
   assert!(probe.events().contains(&TransportEvent::Cancelled));

   let mut conn = t.pool.acquire().await.unwrap();
   assert!(!conn.has_query_in_flight());
   assert_eq!(conn.readiness_watches().outstanding(), 0);
   let result = conn.execute("SELECT 2", &[]).await.unwrap();
   assert_eq!(result.sql, "SELECT 2");
   drop(conn);

   // The cancelled reply never shows up as somebody else's result
   tokio::time::sleep(Duration::from_millis(350)).await;
   let started = std::time::Instant::now();
   let result = t.pool.execute("SLEEP 30 SELECT 3", &[]).await.unwrap();
   assert_eq!(result.sql, "SLEEP 30 SELECT 3");
   assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_aborted_task_hands_clean_connection_to_waiter() {
   let t = setup_sized(1);
   let probe = t.backend.probe(0);

   let pool = t.pool.clone();
   let slow = tokio::spawn(async move { pool.execute("SLEEP 300 SELECT 1", &[]).await });
   wait_until(|| probe.in_flight() == 1).await;

   let pool = t.pool.clone();
   let next = tokio::spawn(async move { pool.execute("SELECT 2", &[json!(2)]).await });
   wait_until(|| t.pool.status().waiting == 1).await;

   slow.abort();
   assert!(slow.await.unwrap_err().is_cancelled());

   let result = next.await.unwrap().unwrap();
   assert_eq!(result.sql, "SELECT 2");
   assert_eq!(result.params, vec![json!(2)]);
   assert_eq!(probe.in_flight(), 0);
   assert_eq!(t.pool.status().idle, 1);
}

#[tokio::test]
async fn test_failed_readiness_registration_cancels_query() {
   let t = setup_sized(1);
   let probe = t.backend.probe(0);
   probe.detach_socket(true);

   let err = t.pool.execute("SELECT 1", &[]).await.unwrap_err();
   assert!(matches!(err, Error::Io(_)));
   assert_eq!(err.error_code(), "IO_ERROR");
   assert_eq!(probe.in_flight(), 0);
   assert!(probe.events().contains(&TransportEvent::Cancelled));
   assert_eq!(t.pool.status().idle, 1);

   probe.detach_socket(false);
   let result = t.pool.execute("SELECT 2", &[]).await.unwrap();
   assert_eq!(result.sql, "SELECT 2");
}

#[test]
fn test_execute_without_runtime_blocks_on_driver() {
   let t = setup_sized(1);

   let result = futures::executor::block_on(t.pool.execute("SELECT 3", &[json!(3)])).unwrap();
   assert_eq!(result.params, vec![json!(3)]);
   assert_eq!(
      t.backend.probe(0).events(),
      vec![TransportEvent::Sync("SELECT 3".to_string())]
   );
   assert_eq!(t.pool.status().idle, 1);
}

#[tokio::test]
async fn test_queries_suspend_inside_runtime() {
   let t = setup_sized(1);

   t.pool.execute("SELECT 4", &[]).await.unwrap();
   assert_eq!(
      t.backend.probe(0).events(),
      vec![
         TransportEvent::Dispatched("SELECT 4".to_string()),
         TransportEvent::Fetched("SELECT 4".to_string()),
      ]
   );
}

#[tokio::test]
async fn test_try_acquire_does_not_wait() {
   let t = setup_sized(1);

   let conn = t.pool.try_acquire().unwrap();
   assert!(t.pool.try_acquire().is_none());
   assert_eq!(t.pool.status().waiting, 0);

   t.pool.release(conn);
   assert!(t.pool.try_acquire().is_some());
}

#[tokio::test]
async fn test_quoting_with_every_connection_checked_out() {
   let t = setup_sized(2);
   let _a = t.pool.acquire().await.unwrap();
   let _b = t.pool.acquire().await.unwrap();

   let quoted = tokio::time::timeout(Duration::from_millis(100), async {
      (
         t.pool.quote(&json!("O'Reilly")),
         t.pool.quote_table_name("public.users"),
         t.pool.quote_column_name("select"),
      )
   })
   .await
   .expect("quoting waited for a connection");

   assert_eq!(quoted.0, "'O''Reilly'");
   assert_eq!(quoted.1, "\"public\".\"users\"");
   assert_eq!(quoted.2, "\"select\"");
   assert_eq!(t.pool.escape_string("it's"), "it''s");
   assert_eq!(t.pool.unescape_bytea("\\x0aff").unwrap(), vec![0x0a, 0xff]);

   let status = t.pool.status();
   assert_eq!(status.reserved, 2);
   assert_eq!(status.waiting, 0);
}

#[tokio::test]
async fn test_escape_hatch_prefers_idle_connection() {
   let t = setup_sized(3);
   let _a = t.pool.acquire().await.unwrap();

   let id = t.pool.any_connection_for(|c| c.id());
   assert_eq!(id, ConnectionId(1));
}

#[test]
fn test_zero_size_pool_is_rejected() {
   let backend = ScriptedBackend::new();
   let result = Pool::connect(PoolConfig::new(0), |_| {
      backend.connect().map_err(DriverError::from_source)
   });
   assert!(matches!(result, Err(Error::InvalidPoolSize)));
   assert_eq!(backend.connections(), 0);
}

#[test]
fn test_connect_failure_names_connection() {
   let backend = ScriptedBackend::new();
   let result = Pool::connect(PoolConfig::new(3), |id| {
      if id == ConnectionId(1) {
         return Err(DriverError::new("password authentication failed").with_sqlstate("28P01"));
      }
      backend.connect().map_err(DriverError::from_source)
   });

   match result {
      Err(Error::Connect { id, source }) => {
         assert_eq!(id, ConnectionId(1));
         assert_eq!(source.sqlstate(), Some("28P01"));
      }
      Err(other) => panic!("expected connect error, got {:?}", other),
      Ok(_) => panic!("expected connect error"),
   }
}
