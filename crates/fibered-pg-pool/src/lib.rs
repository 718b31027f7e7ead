//! # fibered-pg-pool
//!
//! A fixed-size pool of [`fibered_pg_conn::FiberedConnection`]s for tasks
//! sharing one event loop.
//!
//! ## Core Types
//!
//! - **[`Pool`]**: Owns the connections, hands them out and broadcasts
//!   administrative commands to all of them
//! - **[`PoolConfig`]**: Pool size and optional timeouts
//! - **[`PooledConnection`]**: RAII guard for exclusive use of one connection
//! - **[`BroadcastReceipt`]**: Outcome of a broadcast, including the
//!   applications still postponed on checked-out connections
//! - **[`PostponedFailureStream`]**: Failures of postponed commands, reported
//!   after the broadcaster has moved on
//! - **[`Error`]**: Error type for pool operations
//!
//! ## Architecture
//!
//! - **Fixed size**: every connection is opened up front, none are added or closed later
//! - **Direct hand-off**: a released connection goes straight to the longest
//!   waiting caller (FIFO) without passing through the idle set
//! - **Postponed commands**: checked-out connections apply broadcast commands
//!   when released, oldest first, before anyone else can use them
//! - **Reservation-free quoting**: quoting reads session metadata from any
//!   member connection and never waits
//!
//! ## Example
//!
//! ```ignore
//! use fibered_pg_pool::{Pool, PoolConfig};
//! use fibered_pg_conn::AdminCommand;
//!
//! let pool = Pool::connect(PoolConfig::new(5), |_id| open_transport())?;
//!
//! let rows = pool.execute("SELECT * FROM users WHERE id = $1", &[json!(7)]).await?;
//!
//! let receipt = pool.broadcast(AdminCommand::prepare("find_user", "SELECT * FROM users WHERE id = $1"))?;
//! receipt.wait().await?;
//! ```

mod broadcast;
mod config;
mod error;
mod guard;
mod pool;
mod stream;

// Re-export public types
pub use broadcast::{BroadcastReceipt, PendingApplication};
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use guard::PooledConnection;
pub use pool::{OwnerId, Pool, PoolStatus};
pub use stream::{PostponedFailure, PostponedFailureEvent, PostponedFailureStream};
