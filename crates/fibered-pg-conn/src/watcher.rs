//! Single-shot bridge from socket readiness to a fetched query result

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::error::{DriverResult, Result};

/// Borrowed socket descriptor. Dropping it never closes the socket, the
/// transport keeps ownership.
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
   fn as_raw_fd(&self) -> RawFd {
      self.0
   }
}

/// Counts readiness registrations made for one connection.
#[derive(Debug, Default)]
pub(crate) struct WatchLedger {
   registered: AtomicU64,
   released: AtomicU64,
}

/// Snapshot of a connection's readiness registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchStats {
   /// Registrations created over the connection's lifetime.
   pub registered: u64,
   /// Registrations torn down over the connection's lifetime.
   pub released: u64,
}

impl WatchStats {
   /// Registrations still held with the reactor.
   pub fn outstanding(&self) -> u64 {
      self.registered - self.released
   }
}

impl WatchLedger {
   pub(crate) fn stats(&self) -> WatchStats {
      WatchStats {
         registered: self.registered.load(Ordering::Acquire),
         released: self.released.load(Ordering::Acquire),
      }
   }
}

/// One readiness registration with the runtime's reactor.
///
/// The watcher is consumed when it fires, so the result it produces is handed
/// out at most once. The registration is removed from the reactor when the
/// watcher is dropped, whether it fired, failed or was abandoned by a timeout.
pub(crate) struct ReadinessWatcher<'a> {
   registration: AsyncFd<SocketFd>,
   ledger: &'a WatchLedger,
}

impl<'a> ReadinessWatcher<'a> {
   pub(crate) fn register(fd: RawFd, ledger: &'a WatchLedger) -> io::Result<Self> {
      let registration = AsyncFd::with_interest(SocketFd(fd), Interest::READABLE)?;
      ledger.registered.fetch_add(1, Ordering::AcqRel);
      trace!(fd, "Readiness watch registered");
      Ok(Self {
         registration,
         ledger,
      })
   }

   /// Suspends until the socket is readable, detaches, then runs `fetch` once.
   pub(crate) async fn notify_readable<R, F>(self, fetch: F) -> Result<R>
   where
      F: FnOnce() -> DriverResult<R>,
   {
      // Readiness is left set; the registration goes away right after.
      drop(self.registration.readable().await?);
      drop(self);
      Ok(fetch()?)
   }
}

impl Drop for ReadinessWatcher<'_> {
   fn drop(&mut self) {
      self.ledger.released.fetch_add(1, Ordering::AcqRel);
      trace!(fd = self.registration.get_ref().0, "Readiness watch released");
   }
}
