//! Session setup run on every connection before it joins the pool

use fibered_pg_conn::{DriverResult, Transport};
use tracing::debug;

use crate::config::{SessionSettings, Timezone};

/// The statements that bring a fresh session into the configured state, in order.
///
/// `standard_conforming_strings` is not included; see [`bootstrap_session`].
pub fn session_statements(settings: &SessionSettings) -> Vec<String> {
   let mut statements = Vec::new();

   if let Some(encoding) = &settings.encoding {
      statements.push(format!("SET client_encoding TO '{}'", literal(encoding)));
   }

   match &settings.timezone {
      Timezone::Utc => statements.push("SET time zone 'UTC'".to_string()),
      Timezone::Zone(zone) => statements.push(format!("SET time zone '{}'", literal(zone))),
      Timezone::Local => {}
   }

   if let Some(level) = &settings.min_messages {
      statements.push(format!("SET client_min_messages TO '{}'", literal(level)));
   }

   if let Some(path) = &settings.schema_search_path {
      statements.push(format!("SET search_path TO {}", path));
   }

   statements
}

fn literal(value: &str) -> String {
   value.replace('\'', "''")
}

/// Run the session setup on a freshly opened transport.
///
/// Runs synchronously: the connection is not pooled yet and nothing else can
/// be waiting on it. Any failure aborts, except turning on
/// `standard_conforming_strings`, which very old servers do not know.
pub fn bootstrap_session<T: Transport>(
   transport: &mut T,
   settings: &SessionSettings,
) -> DriverResult<()> {
   for sql in session_statements(settings) {
      transport.execute_sync(&sql, &[])?;
   }

   if let Err(e) = transport.execute_sync("SET standard_conforming_strings = on", &[]) {
      debug!(error = %e, "Server does not support standard_conforming_strings");
   }

   Ok(())
}
