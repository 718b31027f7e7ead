use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use fibered_pg_conn::{AdminCommand, ConnectionId, DriverError};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// A postponed administrative command that failed when its connection was released.
///
/// The broadcaster has usually moved on by then, so these failures are
/// published to every subscriber of [`Pool::subscribe_failures`](crate::Pool::subscribe_failures).
#[derive(Debug, Clone)]
pub struct PostponedFailure {
   pub connection: ConnectionId,
   pub command: AdminCommand,
   pub error: DriverError,
   pub timestamp: Instant,
}

/// Item produced by a [`PostponedFailureStream`].
#[derive(Debug, Clone)]
pub enum PostponedFailureEvent {
   Failure(PostponedFailure),
   /// The subscriber fell behind and this many failures were dropped.
   Lagged(u64),
}

type Predicate = Box<dyn Fn(&PostponedFailure) -> bool + Send + Sync>;

/// Failures of postponed commands, as seen by one subscriber.
///
/// Predicates added with [`filter`](Self::filter) must all accept a failure
/// for it to be yielded. Lag notices are never filtered.
pub struct PostponedFailureStream {
   inner: BroadcastStream<PostponedFailure>,
   predicates: Vec<Predicate>,
}

impl fmt::Debug for PostponedFailureStream {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PostponedFailureStream")
         .field("predicates", &self.predicates.len())
         .finish_non_exhaustive()
   }
}

impl PostponedFailureStream {
   pub(crate) fn new(rx: broadcast::Receiver<PostponedFailure>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         predicates: Vec::new(),
      }
   }

   /// Only yield failures `predicate` accepts.
   pub fn filter<F>(mut self, predicate: F) -> Self
   where
      F: Fn(&PostponedFailure) -> bool + Send + Sync + 'static,
   {
      self.predicates.push(Box::new(predicate));
      self
   }

   /// Only yield failures that happened on one of `connections`.
   pub fn on_connections(self, connections: impl IntoIterator<Item = ConnectionId>) -> Self {
      let connections: Vec<ConnectionId> = connections.into_iter().collect();
      self.filter(move |failure| connections.contains(&failure.connection))
   }

   fn accepts(&self, failure: &PostponedFailure) -> bool {
      self.predicates.iter().all(|accept| accept(failure))
   }
}

impl Stream for PostponedFailureStream {
   type Item = PostponedFailureEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         let failure = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            None => return Poll::Ready(None),
            Some(Ok(failure)) => failure,
            Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
               warn!(missed, "Failure subscriber fell behind, postponed failures were dropped");
               return Poll::Ready(Some(PostponedFailureEvent::Lagged(missed)));
            }
         };

         if self.accepts(&failure) {
            return Poll::Ready(Some(PostponedFailureEvent::Failure(failure)));
         }
      }
   }
}
