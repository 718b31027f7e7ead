//! Error types for fibered-pg-conn

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by the underlying driver for a query or administrative command.
///
/// The original cause is kept (when the driver has one) so callers can downcast it.
/// Cloning is cheap: the source is reference counted, which lets one failure be
/// delivered to a waiting broadcaster and to the failure stream at the same time.
#[derive(Debug, Clone)]
pub struct DriverError {
   message: String,
   sqlstate: Option<String>,
   source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
   /// Create a driver error from a plain message.
   pub fn new(message: impl Into<String>) -> Self {
      Self {
         message: message.into(),
         sqlstate: None,
         source: None,
      }
   }

   /// Wrap an error raised by the driver, keeping it as the source.
   pub fn from_source<E>(source: E) -> Self
   where
      E: std::error::Error + Send + Sync + 'static,
   {
      Self {
         message: source.to_string(),
         sqlstate: None,
         source: Some(Arc::new(source)),
      }
   }

   /// Attach a five-character SQLSTATE code.
   pub fn with_sqlstate(mut self, code: impl Into<String>) -> Self {
      self.sqlstate = Some(code.into());
      self
   }

   pub fn message(&self) -> &str {
      &self.message
   }

   pub fn sqlstate(&self) -> Option<&str> {
      self.sqlstate.as_deref()
   }

   /// The driver's original error, if one was captured.
   pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
      self.source.as_deref()
   }
}

impl fmt::Display for DriverError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.sqlstate {
         Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
         None => f.write_str(&self.message),
      }
   }
}

impl std::error::Error for DriverError {
   fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
      self
         .source
         .as_deref()
         .map(|e| e as &(dyn std::error::Error + 'static))
   }
}

/// Errors that may occur when running work on a fibered connection
#[derive(Error, Debug)]
pub enum Error {
   /// The driver rejected the query or failed while fetching its result
   #[error("Driver error: {0}")]
   Driver(#[from] DriverError),

   /// No readiness arrived before the query timeout elapsed
   #[error("Query timed out after {0:?}")]
   QueryTimeout(Duration),

   /// A suspending query was issued outside of a running event loop
   #[error("No event loop is running on this thread")]
   NoEventLoop,

   /// Registering the socket with the reactor failed. Standard library IO
   /// errors are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// The driver failure carried by this error, if any.
   pub fn as_driver_error(&self) -> Option<&DriverError> {
      match self {
         Error::Driver(e) => Some(e),
         _ => None,
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a single driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
