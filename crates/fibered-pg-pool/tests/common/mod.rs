#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fibered_pg_conn::DriverError;
use fibered_pg_conn::testing::{ScriptedBackend, ScriptedTransport};
use fibered_pg_pool::{Pool, PoolConfig};
use tracing_subscriber::EnvFilter;

pub struct TestPool {
   pub pool: Pool<ScriptedTransport>,
   pub backend: Arc<ScriptedBackend>,
}

/// Route pool logs to the test harness's captured output.
pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
}

pub fn setup_pool(config: PoolConfig) -> TestPool {
   init_tracing();
   let backend = Arc::new(ScriptedBackend::new());
   let factory_backend = Arc::clone(&backend);
   let pool = Pool::connect(config, move |_id| {
      factory_backend
         .connect()
         .map_err(DriverError::from_source)
   })
   .unwrap();

   TestPool { pool, backend }
}

pub fn setup_sized(size: usize) -> TestPool {
   setup_pool(PoolConfig::new(size))
}

/// Yield to other tasks until `condition` holds, failing after a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
   let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
   while !condition() {
      assert!(
         tokio::time::Instant::now() < deadline,
         "condition not reached in time"
      );
      tokio::time::sleep(Duration::from_millis(1)).await;
   }
}
