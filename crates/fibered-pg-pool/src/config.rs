//! Configuration for fibered connection pools

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for a [`Pool`](crate::Pool)
///
/// There is deliberately no `Default`: the caller decides how many
/// connections the pool holds.
///
/// # Examples
///
/// ```
/// use fibered_pg_pool::PoolConfig;
/// use std::time::Duration;
///
/// // Five connections, wait forever for one to free up
/// let config = PoolConfig::new(5);
///
/// // Bounded waits for both suspension points
/// let config = PoolConfig::new(5)
///    .with_acquire_timeout(Duration::from_secs(2))
///    .with_query_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
   /// Number of connections, fixed for the lifetime of the pool
   pub size: usize,

   /// How long `acquire` may wait for a connection before failing with
   /// `PoolExhausted`
   ///
   /// Default: None (wait until a connection is released)
   pub acquire_timeout: Option<Duration>,

   /// How long a query may wait for its result before failing with
   /// `QueryTimeout`
   ///
   /// Default: None (wait until the server answers)
   pub query_timeout: Option<Duration>,

   /// Buffered postponed-failure events per subscriber before older events
   /// are dropped
   ///
   /// Default: 64
   pub failure_channel_capacity: usize,
}

impl PoolConfig {
   pub fn new(size: usize) -> Self {
      Self {
         size,
         acquire_timeout: None,
         query_timeout: None,
         failure_channel_capacity: 64,
      }
   }

   pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
      self.acquire_timeout = Some(timeout);
      self
   }

   pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
      self.query_timeout = Some(timeout);
      self
   }

   pub fn with_failure_channel_capacity(mut self, capacity: usize) -> Self {
      self.failure_channel_capacity = capacity;
      self
   }

   pub(crate) fn validate(&self) -> Result<()> {
      if self.size == 0 {
         return Err(Error::InvalidPoolSize);
      }
      Ok(())
   }
}
