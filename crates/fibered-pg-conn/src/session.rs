//! Session metadata and the quoting rules that depend on it
//!
//! Quoting never touches the network: everything here is computed from the
//! settings captured when the connection was opened. That is what lets a pool
//! quote through any member connection without reserving it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DriverError, DriverResult};

/// First server version (9.0) that understands the hex `bytea` format.
const HEX_BYTEA_SERVER_VERSION: u32 = 90_000;

/// Local metadata of one database session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
   /// Client encoding reported by the server, e.g. `UTF8`.
   pub client_encoding: String,

   /// Whether backslashes in ordinary string literals are taken literally.
   ///
   /// Default: true (the server default since 9.1)
   pub standard_conforming_strings: bool,

   /// Server version in `PG_VERSION_NUM` form, e.g. `160002`.
   pub server_version: u32,
}

impl Default for SessionInfo {
   fn default() -> Self {
      Self {
         client_encoding: "UTF8".to_string(),
         standard_conforming_strings: true,
         server_version: 160_000,
      }
   }
}

impl SessionInfo {
   /// Render a JSON value as an SQL literal.
   pub fn quote(&self, value: &JsonValue) -> String {
      match value {
         JsonValue::Null => "NULL".to_string(),
         JsonValue::Bool(true) => "TRUE".to_string(),
         JsonValue::Bool(false) => "FALSE".to_string(),
         JsonValue::Number(n) => n.to_string(),
         JsonValue::String(s) => self.quote_string(s),
         // Arrays and objects go in as json text
         other => self.quote_string(&other.to_string()),
      }
   }

   /// Quote a string literal, including the surrounding quotes.
   pub fn quote_string(&self, s: &str) -> String {
      if self.standard_conforming_strings {
         format!("'{}'", self.escape_string(s))
      } else {
         format!("E'{}'", self.escape_string(s))
      }
   }

   /// Escape a string for use inside a literal, without the surrounding quotes.
   pub fn escape_string(&self, s: &str) -> String {
      let mut out = String::with_capacity(s.len() + 2);
      for c in s.chars() {
         match c {
            '\'' => out.push_str("''"),
            '\\' if !self.standard_conforming_strings => out.push_str("\\\\"),
            _ => out.push(c),
         }
      }
      out
   }

   /// Quote an identifier such as a column name.
   pub fn quote_identifier(&self, name: &str) -> String {
      format!("\"{}\"", name.replace('"', "\"\""))
   }

   /// Quote a possibly schema-qualified table name (`schema.table`).
   pub fn quote_table_name(&self, name: &str) -> String {
      match name.split_once('.') {
         Some((schema, table)) => format!(
            "{}.{}",
            self.quote_identifier(schema),
            self.quote_identifier(table)
         ),
         None => self.quote_identifier(name),
      }
   }

   /// Escape binary data for a `bytea` literal.
   ///
   /// Uses the hex format on 9.0+ servers and the octal escape format before that.
   pub fn escape_bytea(&self, bytes: &[u8]) -> String {
      let backslash = if self.standard_conforming_strings {
         "\\"
      } else {
         "\\\\"
      };

      if self.server_version >= HEX_BYTEA_SERVER_VERSION {
         let mut out = String::with_capacity(bytes.len() * 2 + 3);
         out.push_str(backslash);
         out.push('x');
         for b in bytes {
            out.push_str(&format!("{:02x}", b));
         }
         return out;
      }

      let mut out = String::with_capacity(bytes.len());
      for &b in bytes {
         match b {
            b'\'' => out.push_str("''"),
            b'\\' => {
               out.push_str(backslash);
               out.push_str(backslash);
            }
            0x20..=0x7e => out.push(b as char),
            _ => {
               out.push_str(backslash);
               out.push_str(&format!("{:03o}", b));
            }
         }
      }
      out
   }

   /// Decode `bytea` output text in either hex or escape format.
   pub fn unescape_bytea(&self, text: &str) -> DriverResult<Vec<u8>> {
      if let Some(hex) = text.strip_prefix("\\x") {
         return decode_hex(hex);
      }
      decode_escaped(text)
   }
}

fn decode_hex(hex: &str) -> DriverResult<Vec<u8>> {
   let digits = hex.as_bytes();
   if digits.len() % 2 != 0 {
      return Err(DriverError::new("invalid hexadecimal data: odd number of digits"));
   }

   digits
      .chunks(2)
      .map(|pair| Ok(hex_value(pair[0])? << 4 | hex_value(pair[1])?))
      .collect()
}

fn hex_value(digit: u8) -> DriverResult<u8> {
   match digit {
      b'0'..=b'9' => Ok(digit - b'0'),
      b'a'..=b'f' => Ok(digit - b'a' + 10),
      b'A'..=b'F' => Ok(digit - b'A' + 10),
      other => Err(DriverError::new(format!(
         "invalid hexadecimal digit: {:?}",
         other as char
      ))),
   }
}

fn decode_escaped(text: &str) -> DriverResult<Vec<u8>> {
   let bytes = text.as_bytes();
   let mut out = Vec::with_capacity(bytes.len());
   let mut i = 0;

   while i < bytes.len() {
      if bytes[i] != b'\\' {
         out.push(bytes[i]);
         i += 1;
         continue;
      }

      match bytes.get(i + 1..i + 4) {
         _ if bytes.get(i + 1) == Some(&b'\\') => {
            out.push(b'\\');
            i += 2;
         }
         Some(octal) if octal.iter().all(|d| (b'0'..=b'7').contains(d)) => {
            let value = octal
               .iter()
               .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
            let byte = u8::try_from(value)
               .map_err(|_| DriverError::new("invalid bytea escape: octal value out of range"))?;
            out.push(byte);
            i += 4;
         }
         _ => return Err(DriverError::new("invalid bytea escape sequence")),
      }
   }

   Ok(out)
}
