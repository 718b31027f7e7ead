/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

use fibered_pg_conn::DriverError;

/// Error types for the adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection pool, including driver failures.
   #[error(transparent)]
   Pool(#[from] fibered_pg_pool::Error),

   /// The configuration does not name a database.
   #[error("no database specified, missing argument: database")]
   MissingDatabase,

   /// A configuration value is out of range.
   #[error("invalid configuration: {0}")]
   InvalidConfig(String),

   /// Transaction has already been committed or rolled back.
   #[error("transaction has already been finalized (committed or rolled back)")]
   TransactionAlreadyFinalized,

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },
}

impl From<DriverError> for Error {
   fn from(e: DriverError) -> Self {
      Error::Pool(fibered_pg_pool::Error::Driver(e))
   }
}

impl Error {
   /// The driver failure behind this error, if there is one.
   pub fn as_driver_error(&self) -> Option<&DriverError> {
      match self {
         Error::Pool(e) => e.as_driver_error(),
         _ => None,
      }
   }

   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Pool(e) => e.error_code(),
         Error::MissingDatabase => "MISSING_DATABASE".to_string(),
         Error::InvalidConfig(_) => "INVALID_CONFIG".to_string(),
         Error::TransactionAlreadyFinalized => "TRANSACTION_ALREADY_FINALIZED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
      }
   }
}
