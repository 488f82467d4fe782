//! Identifier derivation.
//!
//! Every tracked subject is reduced to an [`Identifier`]: the hex-encoded
//! SHA-256 digest of the configured key prefix followed by a base string built
//! from the client IP, the login subject, and an optional context. The digest
//! keeps raw e-mail addresses and IPs out of storage keys and bounds the key
//! length for every backend.
//!
//! Each base component is written as `<byte length>:<value>` and components
//! are joined with `|`, so a `|` inside a subject cannot shift a boundary.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

const SEPARATOR: char = '|';

/// Extra request attributes mixed into the identifier.
///
/// Objects at every depth are re-sorted by key before hashing, so the
/// identifier does not depend on insertion order or on whether `serde_json`
/// preserves it.
pub type Context = BTreeMap<String, serde_json::Value>;

/// Which request attributes form the tracked key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierMode {
    /// Track the login subject (username, e-mail) regardless of source IP.
    IdentifierOnly,
    /// Track the client IP regardless of subject.
    IpOnly,
    /// Track each (subject, IP) pair separately.
    IdentifierAndIp,
}

/// Opaque, fixed-length storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap an already derived key, e.g. one read back from storage.
    pub fn new(value: impl Into<String>) -> Self {
        Identifier(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The request an engine operation is about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub ip: String,
    pub subject: String,
    pub context: Context,
}

impl Target {
    pub fn new(ip: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            subject: subject.into(),
            context: Context::new(),
        }
    }

    /// Attach a serializable context. The value must serialize to a JSON
    /// object (or `null`, meaning no context).
    pub fn with_context<C: Serialize + ?Sized>(mut self, context: &C) -> Result<Self, ConfigError> {
        let value = serde_json::to_value(context)
            .map_err(|e| ConfigError::InvalidContext(e.to_string()))?;

        self.context = match value {
            serde_json::Value::Null => Context::new(),
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(ConfigError::InvalidContext(format!(
                    "context must serialize to an object, got {}",
                    json_kind(&other)
                )));
            }
        };

        Ok(self)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn push_component(base: &mut String, value: &str) {
    if !base.is_empty() {
        base.push(SEPARATOR);
    }
    base.push_str(&value.len().to_string());
    base.push(':');
    base.push_str(value);
}

/// Rebuild `value` with every object's keys in ascending order.
///
/// Keys are inserted already sorted, which serializes the same whether
/// `serde_json::Map` sorts or keeps insertion order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let ordered: BTreeMap<&String, serde_json::Value> = map
                .iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            serde_json::Value::Object(
                ordered
                    .into_iter()
                    .map(|(key, value)| (key.clone(), value))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Derives identifiers for one mode and namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierStrategy {
    mode: IdentifierMode,
    key_prefix: String,
}

impl IdentifierStrategy {
    pub fn new(mode: IdentifierMode, key_prefix: impl Into<String>) -> Self {
        Self {
            mode,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn mode(&self) -> IdentifierMode {
        self.mode
    }

    /// Derive the identifier for a request.
    ///
    /// Pure: the same inputs under the same strategy always give the same key.
    pub fn make_id(
        &self,
        ip: &str,
        subject: &str,
        context: &Context,
    ) -> Result<Identifier, ConfigError> {
        let mut base = String::new();
        match self.mode {
            IdentifierMode::IdentifierOnly => push_component(&mut base, subject),
            IdentifierMode::IpOnly => push_component(&mut base, ip),
            IdentifierMode::IdentifierAndIp => {
                push_component(&mut base, subject);
                push_component(&mut base, ip);
            }
        }

        if !context.is_empty() {
            let sorted: serde_json::Map<String, serde_json::Value> = context
                .iter()
                .map(|(key, value)| (key.clone(), canonicalize(value)))
                .collect();
            let canonical = serde_json::to_string(&sorted)
                .map_err(|e| ConfigError::InvalidContext(e.to_string()))?;
            push_component(&mut base, &canonical);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.key_prefix.as_bytes());
        hasher.update(base.as_bytes());
        Ok(Identifier(hex::encode(hasher.finalize())))
    }

    pub fn for_target(&self, target: &Target) -> Result<Identifier, ConfigError> {
        self.make_id(&target.ip, &target.subject, &target.context)
    }
}
