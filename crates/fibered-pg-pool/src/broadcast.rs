//! Receipts for administrative commands broadcast across a pool

use fibered_pg_conn::{AdminCommand, Completion, ConnectionId, DriverError};

use crate::{Error, Result};

/// A broadcast command still waiting for a checked-out connection.
#[derive(Debug)]
pub struct PendingApplication {
   pub connection: ConnectionId,
   completion: Completion,
}

impl PendingApplication {
   pub(crate) fn new(connection: ConnectionId, completion: Completion) -> Self {
      Self {
         connection,
         completion,
      }
   }
}

/// What a broadcast did right away and what it left for later.
///
/// Dropping the receipt does not cancel anything: postponed applications still
/// run when their connections are released, and failures still reach the
/// pool's failure stream.
#[derive(Debug)]
#[must_use = "postponed applications can only be awaited through the receipt"]
pub struct BroadcastReceipt {
   command: AdminCommand,
   applied: Vec<ConnectionId>,
   pending: Vec<PendingApplication>,
}

impl BroadcastReceipt {
   pub(crate) fn new(
      command: AdminCommand,
      applied: Vec<ConnectionId>,
      pending: Vec<PendingApplication>,
   ) -> Self {
      Self {
         command,
         applied,
         pending,
      }
   }

   pub fn command(&self) -> &AdminCommand {
      &self.command
   }

   /// Connections the command was applied to during the broadcast.
   pub fn applied(&self) -> &[ConnectionId] {
      &self.applied
   }

   /// Connections that will apply the command when they are released.
   pub fn postponed(&self) -> Vec<ConnectionId> {
      self.pending.iter().map(|p| p.connection).collect()
   }

   /// True when nothing was postponed.
   pub fn is_complete(&self) -> bool {
      self.pending.is_empty()
   }

   /// Wait until every postponed application has run.
   ///
   /// Resolves once all connections that were checked out during the
   /// broadcast have been released. Failures are reported together as
   /// [`Error::BroadcastPartialFailure`].
   pub async fn wait(self) -> Result<()> {
      let mut applied = self.applied.len();
      let mut failed = Vec::new();

      for pending in self.pending {
         match pending.completion.await {
            Ok(Ok(())) => applied += 1,
            Ok(Err(e)) => failed.push((pending.connection, e)),
            Err(_) => failed.push((
               pending.connection,
               DriverError::new("connection dropped before the postponed command ran"),
            )),
         }
      }

      if failed.is_empty() {
         return Ok(());
      }

      Err(Error::BroadcastPartialFailure {
         command: self.command,
         failed,
         applied,
         postponed: None,
      })
   }
}
