//! State key derivation.
//!
//! Every instance maps to exactly one key:
//!
//! ```text
//! <prefix>/<region>/<environment>/<instance>/terrace.tfstate
//! ```
//!
//! Components are percent-encoded outside `[A-Za-z0-9_-]`, which keeps keys
//! path-safe and makes the mapping injective: [`StateLocator::parse`]
//! recovers the identity from any key it produced.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use terrace_spec::models::InstanceId;

use crate::error::{IacError, IacResult};

pub const STATE_FILE: &str = "terrace.tfstate";

/// Opaque key addressing one state record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    /// Rebuild a key from its stored text, e.g. while listing a backend.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components of the key.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives state keys from instance identity.
#[derive(Debug, Clone)]
pub struct StateLocator {
    prefix: String,
}

impl StateLocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for an (environment, region, instance) triple.
    pub fn key_for(&self, environment: &str, region: &str, instance: &str) -> StateKey {
        StateKey(format!(
            "{}/{}/{}/{}/{}",
            encode(&self.prefix),
            encode(region),
            encode(environment),
            encode(instance),
            STATE_FILE
        ))
    }

    pub fn key(&self, id: &InstanceId) -> StateKey {
        self.key_for(&id.environment, &id.region, &id.name)
    }

    /// Prefix shared by every key of one environment in one region.
    pub fn environment_prefix(&self, environment: &str, region: &str) -> String {
        format!(
            "{}/{}/{}/",
            encode(&self.prefix),
            encode(region),
            encode(environment)
        )
    }

    /// Recover the instance identity from a key under this locator's prefix.
    pub fn parse(&self, key: &StateKey) -> IacResult<InstanceId> {
        let invalid = || IacError::InvalidStateKey(key.to_string());
        let parts: Vec<&str> = key.components().collect();
        let [prefix, region, environment, instance, file] = parts.as_slice() else {
            return Err(invalid());
        };
        if *file != STATE_FILE || decode(prefix).as_deref() != Some(self.prefix.as_str()) {
            return Err(invalid());
        }
        Ok(InstanceId::new(
            decode(environment).ok_or_else(invalid)?,
            decode(region).ok_or_else(invalid)?,
            decode(instance).ok_or_else(invalid)?,
        ))
    }

    /// Fail if two instances would share a key.
    pub fn check_unique<'a>(
        &self,
        instances: impl IntoIterator<Item = &'a InstanceId>,
    ) -> IacResult<()> {
        let mut seen: HashMap<StateKey, &InstanceId> = HashMap::new();
        for id in instances {
            let key = self.key(id);
            if let Some(first) = seen.get(&key) {
                return Err(IacError::StateKeyCollision {
                    key: key.to_string(),
                    first: first.to_string(),
                    second: id.to_string(),
                });
            }
            seen.insert(key, id);
        }
        Ok(())
    }
}

fn encode(component: &str) -> String {
    if component.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode(component: &str) -> Option<String> {
    if component == "%" {
        return Some(String::new());
    }
    let bytes = component.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = component.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
