//! Administrative commands deferred against a checked-out connection

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{DriverError, DriverResult};
use crate::transport::AdminCommand;

/// Receives the outcome of one postponed command once it has run.
pub type Completion = oneshot::Receiver<DriverResult<()>>;

/// A command waiting for its connection to be released.
#[derive(Debug)]
pub struct PostponedOperation {
   command: AdminCommand,
   completion: Option<oneshot::Sender<DriverResult<()>>>,
}

impl PostponedOperation {
   /// A postponed command nobody waits on.
   pub fn new(command: AdminCommand) -> Self {
      Self {
         command,
         completion: None,
      }
   }

   /// A postponed command plus the receiver its outcome will be sent to.
   pub fn with_completion(command: AdminCommand) -> (Self, Completion) {
      let (tx, rx) = oneshot::channel();
      let op = Self {
         command,
         completion: Some(tx),
      };
      (op, rx)
   }

   pub fn command(&self) -> &AdminCommand {
      &self.command
   }

   pub(crate) fn complete(self, outcome: DriverResult<()>) {
      if let Some(tx) = self.completion {
         // The broadcaster may have stopped listening; the outcome is still
         // reported through the drain report.
         let _ = tx.send(outcome);
      }
   }
}

/// FIFO queue of postponed operations owned by one connection.
#[derive(Debug, Default)]
pub(crate) struct PostponedQueue {
   ops: Mutex<VecDeque<PostponedOperation>>,
}

impl PostponedQueue {
   pub(crate) fn push(&self, op: PostponedOperation) {
      self.ops.lock().push_back(op);
   }

   /// Takes every queued operation, oldest first.
   pub(crate) fn take_all(&self) -> VecDeque<PostponedOperation> {
      std::mem::take(&mut *self.ops.lock())
   }

   pub(crate) fn len(&self) -> usize {
      self.ops.lock().len()
   }
}

/// Outcome of draining a connection's postponed queue.
#[derive(Debug, Default)]
pub struct PostponedReport {
   /// Commands that ran successfully, in the order they ran.
   pub applied: Vec<AdminCommand>,
   /// Commands that failed, with the driver's error.
   pub failed: Vec<(AdminCommand, DriverError)>,
}

impl PostponedReport {
   pub fn is_empty(&self) -> bool {
      self.applied.is_empty() && self.failed.is_empty()
   }
}
