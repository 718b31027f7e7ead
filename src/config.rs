//! Adapter configuration and the connection options derived from it

use std::fmt;
use std::time::Duration;

use fibered_pg_pool::PoolConfig;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Pool size used when the configuration does not name one.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// PostgreSQL's default port.
pub const DEFAULT_PORT: u16 = 5432;

/// Time zone the session reports `TIMESTAMP WITH TIME ZONE` values in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Timezone {
   /// `SET time zone 'UTC'`
   #[default]
   Utc,
   /// Keep whatever the server is configured with.
   Local,
   /// An explicit zone name such as `Europe/Berlin`.
   Zone(String),
}

impl From<String> for Timezone {
   fn from(value: String) -> Self {
      match value.to_ascii_lowercase().as_str() {
         "utc" => Timezone::Utc,
         "local" => Timezone::Local,
         _ => Timezone::Zone(value),
      }
   }
}

impl From<Timezone> for String {
   fn from(value: Timezone) -> Self {
      match value {
         Timezone::Utc => "utc".to_string(),
         Timezone::Local => "local".to_string(),
         Timezone::Zone(zone) => zone,
      }
   }
}

/// Adapter configuration, usually deserialized from a settings file.
///
/// # Examples
///
/// ```
/// use fibered_pg_adapter::AdapterConfig;
///
/// let config: AdapterConfig = serde_json::from_value(serde_json::json!({
///    "database": "app_production",
///    "pool": 10,
///    "prepared_statements": "false",
/// }))
/// .unwrap();
///
/// assert_eq!(config.port, 5432);
/// assert!(!config.prepared_statements);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
   #[serde(default)]
   pub host: Option<String>,

   /// Default: 5432
   #[serde(default = "default_port")]
   pub port: u16,

   #[serde(default)]
   pub username: String,

   #[serde(default)]
   pub password: String,

   /// Required. [`AdapterConfig::validate`] fails without it.
   #[serde(default)]
   pub database: Option<String>,

   /// Number of connections opened up front
   ///
   /// Default: [`DEFAULT_POOL_SIZE`]
   #[serde(default = "default_pool_size")]
   pub pool: usize,

   /// Client encoding set on every new connection
   #[serde(default)]
   pub encoding: Option<String>,

   /// Value for `client_min_messages`
   #[serde(default)]
   pub min_messages: Option<String>,

   /// Value for `search_path`, e.g. `"app,public"`
   #[serde(default)]
   pub schema_search_path: Option<String>,

   #[serde(default)]
   pub timezone: Timezone,

   /// Accepts a boolean or the strings `"true"` / `"false"`.
   ///
   /// Default: true
   #[serde(default = "default_true", deserialize_with = "flexible_bool")]
   pub prepared_statements: bool,

   /// How long `acquire` may wait for a connection. Unset waits forever.
   #[serde(default)]
   pub acquire_timeout_ms: Option<u64>,

   /// How long a query may wait for its result. Unset waits forever.
   #[serde(default)]
   pub query_timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
   DEFAULT_PORT
}

fn default_pool_size() -> usize {
   DEFAULT_POOL_SIZE
}

fn default_true() -> bool {
   true
}

/// Settings files written by hand often quote booleans.
fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
   D: Deserializer<'de>,
{
   #[derive(Deserialize)]
   #[serde(untagged)]
   enum BoolOrString {
      Bool(bool),
      Text(String),
   }

   Ok(match BoolOrString::deserialize(deserializer)? {
      BoolOrString::Bool(b) => b,
      BoolOrString::Text(s) => s == "true",
   })
}

impl fmt::Debug for AdapterConfig {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AdapterConfig")
         .field("host", &self.host)
         .field("port", &self.port)
         .field("username", &self.username)
         .field("password", &"<redacted>")
         .field("database", &self.database)
         .field("pool", &self.pool)
         .field("encoding", &self.encoding)
         .field("min_messages", &self.min_messages)
         .field("schema_search_path", &self.schema_search_path)
         .field("timezone", &self.timezone)
         .field("prepared_statements", &self.prepared_statements)
         .field("acquire_timeout_ms", &self.acquire_timeout_ms)
         .field("query_timeout_ms", &self.query_timeout_ms)
         .finish()
   }
}

impl AdapterConfig {
   /// Configuration for `database` with every other setting at its default.
   pub fn new(database: impl Into<String>) -> Self {
      Self {
         host: None,
         port: DEFAULT_PORT,
         username: String::new(),
         password: String::new(),
         database: Some(database.into()),
         pool: DEFAULT_POOL_SIZE,
         encoding: None,
         min_messages: None,
         schema_search_path: None,
         timezone: Timezone::default(),
         prepared_statements: true,
         acquire_timeout_ms: None,
         query_timeout_ms: None,
      }
   }

   /// Check the settings that have no usable default.
   pub fn validate(&self) -> Result<()> {
      if self.database.is_none() {
         return Err(Error::MissingDatabase);
      }
      if self.pool == 0 {
         return Err(Error::InvalidConfig("pool must be at least 1".to_string()));
      }
      Ok(())
   }

   /// Options handed to the connector for every new connection.
   pub fn connect_options(&self) -> Result<ConnectOptions> {
      let database = self.database.clone().ok_or(Error::MissingDatabase)?;
      Ok(ConnectOptions {
         host: self.host.clone(),
         port: self.port,
         database,
         username: self.username.clone(),
         password: self.password.clone(),
      })
   }

   /// Statements that bring a fresh connection into the configured state.
   pub fn session_settings(&self) -> SessionSettings {
      SessionSettings {
         encoding: self.encoding.clone(),
         timezone: self.timezone.clone(),
         min_messages: self.min_messages.clone(),
         schema_search_path: self.schema_search_path.clone(),
      }
   }

   pub fn pool_config(&self) -> PoolConfig {
      let mut config = PoolConfig::new(self.pool);
      if let Some(ms) = self.acquire_timeout_ms {
         config = config.with_acquire_timeout(Duration::from_millis(ms));
      }
      if let Some(ms) = self.query_timeout_ms {
         config = config.with_query_timeout(Duration::from_millis(ms));
      }
      config
   }
}

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
   pub host: Option<String>,
   pub port: u16,
   pub database: String,
   pub username: String,
   pub password: String,
}

impl fmt::Debug for ConnectOptions {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectOptions")
         .field("host", &self.host)
         .field("port", &self.port)
         .field("database", &self.database)
         .field("username", &self.username)
         .field("password", &"<redacted>")
         .finish()
   }
}

/// Per-session settings applied right after a connection is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
   pub encoding: Option<String>,
   pub timezone: Timezone,
   pub min_messages: Option<String>,
   pub schema_search_path: Option<String>,
}
