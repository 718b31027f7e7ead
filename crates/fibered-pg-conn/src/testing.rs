//! Socket-backed transport for exercising fibered connections in tests
//!
//! Every [`ScriptedTransport`] owns one end of a `UnixStream` pair. Dispatching a
//! query arranges for a byte to be written to the other end, so readiness is
//! delivered by the OS multiplexer exactly as it would be for a real server.
//!
//! The SQL text scripts the reply:
//!
//! - `FAIL <message>` fails with `<message>` (SQLSTATE `XX000`)
//! - `SLEEP <ms> ...` replies after `<ms>` milliseconds
//! - `HANG` never replies
//! - anything else replies immediately with a [`ScriptedResult`] echoing the query
//!
//! Administrative commands fail when their SQL starts with `FAIL` or when the
//! connection's probe has been told to reject them. A backend can also fail
//! every query containing a given text, see
//! [`ScriptedBackend::fail_queries_containing`].
//!
//! Cancelling a query discards its reply, including a delayed one that has
//! not been written yet.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::error::{DriverError, DriverResult};
use crate::session::SessionInfo;
use crate::transport::{AdminCommand, Transport};

/// What a scripted connection did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
   Dispatched(String),
   Fetched(String),
   Sync(String),
   Applied(AdminCommand),
   Rejected(AdminCommand),
   Cancelled,
}

/// Result returned by a scripted query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedResult {
   /// Index of the connection that ran the query.
   pub connection: usize,
   pub sql: String,
   pub params: Vec<JsonValue>,
}

/// Observation handle shared between a test and one scripted connection.
#[derive(Debug, Default)]
pub struct TransportProbe {
   events: Mutex<Vec<TransportEvent>>,
   reject_admin: AtomicBool,
   detached_socket: AtomicBool,
   in_flight: AtomicUsize,
}

impl TransportProbe {
   pub fn events(&self) -> Vec<TransportEvent> {
      self.events.lock().clone()
   }

   /// Administrative commands applied successfully, in order.
   pub fn applied(&self) -> Vec<AdminCommand> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            TransportEvent::Applied(cmd) => Some(cmd.clone()),
            _ => None,
         })
         .collect()
   }

   /// Make every following administrative command fail.
   pub fn reject_admin(&self, reject: bool) {
      self.reject_admin.store(reject, Ordering::SeqCst);
   }

   /// Report an invalid socket descriptor so readiness registration fails.
   pub fn detach_socket(&self, detached: bool) {
      self.detached_socket.store(detached, Ordering::SeqCst);
   }

   /// Queries dispatched but not yet fetched or cancelled.
   pub fn in_flight(&self) -> usize {
      self.in_flight.load(Ordering::SeqCst)
   }

   fn record(&self, event: TransportEvent) {
      self.events.lock().push(event);
   }
}

/// Hands out scripted transports and keeps their probes.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
   session: SessionInfo,
   fail_containing: Mutex<Option<String>>,
   probes: Mutex<Vec<Arc<TransportProbe>>>,
}

impl ScriptedBackend {
   pub fn new() -> Self {
      Self::default()
   }

   /// Use `session` as the metadata of every connection opened afterwards.
   pub fn with_session(session: SessionInfo) -> Self {
      Self {
         session,
         fail_containing: Mutex::default(),
         probes: Mutex::default(),
      }
   }

   /// Connections opened afterwards fail every query whose SQL contains `needle`.
   pub fn fail_queries_containing(&self, needle: impl Into<String>) {
      *self.fail_containing.lock() = Some(needle.into());
   }

   /// Open a new scripted connection.
   pub fn connect(&self) -> io::Result<ScriptedTransport> {
      let (socket, peer) = UnixStream::pair()?;
      let probe = Arc::new(TransportProbe::default());
      let index = {
         let mut probes = self.probes.lock();
         probes.push(Arc::clone(&probe));
         probes.len() - 1
      };

      Ok(ScriptedTransport {
         index,
         socket,
         peer,
         pending: None,
         generation: Arc::new(AtomicU64::new(0)),
         session: self.session.clone(),
         fail_containing: self.fail_containing.lock().clone(),
         probe,
      })
   }

   /// Probe of the `index`th connection opened (0-based).
   pub fn probe(&self, index: usize) -> Arc<TransportProbe> {
      Arc::clone(&self.probes.lock()[index])
   }

   /// Number of connections opened so far.
   pub fn connections(&self) -> usize {
      self.probes.lock().len()
   }
}

enum Reply {
   Immediate,
   After(Duration),
   Never,
}

fn script(sql: &str) -> Reply {
   if sql.starts_with("HANG") {
      return Reply::Never;
   }
   if let Some(rest) = sql.strip_prefix("SLEEP ") {
      let millis = rest
         .split_whitespace()
         .next()
         .and_then(|ms| ms.parse().ok())
         .unwrap_or(0);
      return Reply::After(Duration::from_millis(millis));
   }
   Reply::Immediate
}

/// Transport whose replies are driven by the SQL text.
pub struct ScriptedTransport {
   index: usize,
   socket: UnixStream,
   peer: UnixStream,
   pending: Option<(String, Vec<JsonValue>)>,
   /// Bumped on every dispatch and cancel; a delayed reply for an older
   /// generation is dropped.
   generation: Arc<AtomicU64>,
   session: SessionInfo,
   fail_containing: Option<String>,
   probe: Arc<TransportProbe>,
}

impl ScriptedTransport {
   pub fn index(&self) -> usize {
      self.index
   }

   pub fn probe(&self) -> &Arc<TransportProbe> {
      &self.probe
   }

   fn reply(&self, sql: &str, params: Vec<JsonValue>) -> DriverResult<ScriptedResult> {
      if let Some(message) = sql.strip_prefix("FAIL") {
         return Err(DriverError::new(message.trim()).with_sqlstate("XX000"));
      }
      if let Some(needle) = &self.fail_containing
         && sql.contains(needle.as_str())
      {
         return Err(DriverError::new(format!("scripted failure: {}", sql)).with_sqlstate("XX000"));
      }
      Ok(ScriptedResult {
         connection: self.index,
         sql: sql.to_string(),
         params,
      })
   }

   fn wake(&self, after: Option<Duration>) -> DriverResult<()> {
      let mut peer = self.peer.try_clone().map_err(DriverError::from_source)?;
      match after {
         None => peer.write_all(&[1]).map_err(DriverError::from_source),
         Some(delay) => {
            let generation = Arc::clone(&self.generation);
            let issued = generation.load(Ordering::SeqCst);
            thread::spawn(move || {
               thread::sleep(delay);
               if generation.load(Ordering::SeqCst) == issued {
                  let _ = peer.write_all(&[1]);
               }
            });
            Ok(())
         }
      }
   }

   /// Throw away reply bytes that were already written for a cancelled query.
   fn discard_replies(&mut self) -> io::Result<()> {
      self.socket.set_nonblocking(true)?;
      let mut buf = [0u8; 16];
      let drained = loop {
         match self.socket.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) => break Err(e),
         }
      };
      self.socket.set_nonblocking(false)?;
      drained
   }
}

impl Transport for ScriptedTransport {
   type Output = ScriptedResult;

   fn dispatch(&mut self, sql: &str, params: &[JsonValue]) -> DriverResult<()> {
      if self.pending.is_some() {
         return Err(DriverError::new("another command is already in progress"));
      }

      self.probe.record(TransportEvent::Dispatched(sql.to_string()));
      self.probe.in_flight.fetch_add(1, Ordering::SeqCst);
      self.pending = Some((sql.to_string(), params.to_vec()));
      self.generation.fetch_add(1, Ordering::SeqCst);

      match script(sql) {
         Reply::Immediate => self.wake(None),
         Reply::After(delay) => self.wake(Some(delay)),
         Reply::Never => Ok(()),
      }
   }

   fn fetch_result(&mut self) -> DriverResult<ScriptedResult> {
      let (sql, params) = self
         .pending
         .take()
         .ok_or_else(|| DriverError::new("no query in progress"))?;

      let mut byte = [0u8; 1];
      self
         .socket
         .read_exact(&mut byte)
         .map_err(DriverError::from_source)?;

      self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
      self.probe.record(TransportEvent::Fetched(sql.clone()));
      self.reply(&sql, params)
   }

   fn socket(&self) -> RawFd {
      if self.probe.detached_socket.load(Ordering::SeqCst) {
         return -1;
      }
      self.socket.as_raw_fd()
   }

   fn execute_sync(&mut self, sql: &str, params: &[JsonValue]) -> DriverResult<ScriptedResult> {
      self.probe.record(TransportEvent::Sync(sql.to_string()));
      match script(sql) {
         Reply::Never => Err(DriverError::new("scripted HANG cannot complete synchronously")),
         Reply::After(delay) => {
            thread::sleep(delay);
            self.reply(sql, params.to_vec())
         }
         Reply::Immediate => self.reply(sql, params.to_vec()),
      }
   }

   fn apply(&mut self, command: &AdminCommand) -> DriverResult<()> {
      let scripted_failure = match command {
         AdminCommand::Prepare { sql, .. } | AdminCommand::Session { sql } => {
            sql.starts_with("FAIL")
         }
         AdminCommand::Deallocate { .. } => false,
      };

      if scripted_failure || self.probe.reject_admin.load(Ordering::SeqCst) {
         self.probe.record(TransportEvent::Rejected(command.clone()));
         return Err(DriverError::new(format!("command rejected: {}", command.label()))
            .with_sqlstate("XX000"));
      }

      self.probe.record(TransportEvent::Applied(command.clone()));
      Ok(())
   }

   fn cancel(&mut self) -> DriverResult<()> {
      self.generation.fetch_add(1, Ordering::SeqCst);
      if self.pending.take().is_some() {
         self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
      }
      self.discard_replies().map_err(DriverError::from_source)?;
      self.probe.record(TransportEvent::Cancelled);
      Ok(())
   }

   fn session(&self) -> SessionInfo {
      self.session.clone()
   }
}
