//! Canonical keys derived from builder configs.
//!
//! A [`Key`] is the cache identity of a config. The encoding is exact rather
//! than hashed: two configs share a key only when their significant content is
//! equal. Object members whose name starts with `_` are carried in the stored
//! config but never take part in the key.

mod map_keys;

use std::fmt::{self, Display, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ConfigError;

/// Input of a builder. Only strings, numbers, arrays and objects are valid.
pub type Config = Value;

/// Canonical string form of a [`Config`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of an entry: the builder name together with the config key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub builder: Arc<str>,
    pub key: Key,
}

impl TaskId {
    pub fn new(builder: impl Into<Arc<str>>, key: Key) -> Self {
        Self {
            builder: builder.into(),
            key,
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.builder, self.key)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.builder, self.key.as_str())
    }
}

/// Derive the canonical key of a config.
pub fn canonicalize(config: &Config) -> Result<Key, ConfigError> {
    let mut out = String::new();
    encode(config, &mut out)?;
    Ok(Key(out))
}

/// Convert any serializable value into a [`Config`].
///
/// Maps must be keyed by strings, and every value must be one the key codec
/// accepts.
pub fn to_config<T>(value: T) -> Result<Config, ConfigError>
where
    T: Serialize,
{
    map_keys::check(&value).map_err(|e| ConfigError::Key(e.to_string()))?;
    let config = serde_json::to_value(value).map_err(|e| ConfigError::Key(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    match config {
        Value::String(_) | Value::Number(_) => Ok(()),
        Value::Array(items) => items.iter().try_for_each(validate),
        Value::Object(map) => map.values().try_for_each(validate),
        Value::Null | Value::Bool(_) => Err(unsupported(config)),
    }
}

fn encode(config: &Config, out: &mut String) -> Result<(), ConfigError> {
    match config {
        Value::String(s) => encode_str(s, out),
        Value::Number(n) => encode_number(n, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => encode_object(map, out)?,
        Value::Null | Value::Bool(_) => return Err(unsupported(config)),
    }

    Ok(())
}

fn encode_object(map: &Map<String, Value>, out: &mut String) -> Result<(), ConfigError> {
    // serde_json may preserve insertion order, the key must not
    let mut members: Vec<_> = map
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .collect();
    members.sort_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (name, value)) in members.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_str(name, out);
        out.push(':');
        encode(value, out)?;
    }
    out.push('}');

    Ok(())
}

fn encode_str(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

fn encode_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        // Debug keeps the fraction, 1.0 never collides with 1
        let _ = write!(out, "{f:?}");
    }
}

fn unsupported(config: &Config) -> ConfigError {
    let kind = match config {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        _ => "value",
    };
    ConfigError::Unsupported(format!("'{config}', type: {kind}"))
}
