//! # fibered-pg-adapter
//!
//! A PostgreSQL adapter for single-threaded event loops. Queries suspend the
//! calling task until the server answers instead of blocking the thread, and
//! connections come from a fixed-size pool.
//!
//! ## Core Types
//!
//! - **[`Adapter`]**: Opens and configures the pool, runs queries, broadcasts
//!   prepared statements and session settings, quotes values
//! - **[`AdapterConfig`]**: Settings, usually deserialized from a settings file
//! - **[`Connector`]**: Opens one driver transport per pool slot
//! - **[`Transaction`]**: A transaction pinned to one checked-out connection
//!
//! # Example
//!
//! ```ignore
//! use fibered_pg_adapter::{Adapter, AdapterConfig};
//!
//! let config: AdapterConfig = serde_json::from_str(settings)?;
//! let adapter = Adapter::establish(config, |_id, options: &ConnectOptions| {
//!    MyDriver::connect(options)
//! })?;
//!
//! let rows = adapter.async_exec("SELECT * FROM users WHERE id = $1", &[json!(7)]).await?;
//! ```

mod adapter;
mod bootstrap;
mod config;
mod error;
mod transactions;

pub use adapter::{ADAPTER_NAME, Adapter, Connector};
pub use bootstrap::{bootstrap_session, session_statements};
pub use config::{
   AdapterConfig, ConnectOptions, DEFAULT_POOL_SIZE, DEFAULT_PORT, SessionSettings, Timezone,
};
pub use error::{Error, Result};
pub use transactions::Transaction;

// Re-export the layers underneath so callers need only one dependency
pub use fibered_pg_conn::{
   AdminCommand, ConnectionId, DriverError, DriverResult, SessionInfo, Transport,
};
pub use fibered_pg_pool::{
   BroadcastReceipt, PoolConfig, PoolStatus, PooledConnection, PostponedFailure,
   PostponedFailureEvent, PostponedFailureStream,
};
