//! Cross-instance references of the form `${dependency.<name>.outputs.<output>}`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// A reference from an instance input to a dependency output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyRef {
    pub dependency: String,
    pub output: String,
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency.{}.outputs.{}", self.dependency, self.output)
    }
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{dependency\.([A-Za-z][A-Za-z0-9_-]*)\.outputs\.([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("dependency reference pattern is valid")
    })
}

/// Returns the reference if `value` is a string holding exactly one reference.
pub fn as_whole_reference(value: &Value) -> Option<DependencyRef> {
    let Value::String(s) = value else {
        return None;
    };
    let caps = pattern().captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        Some(DependencyRef {
            dependency: caps[1].to_string(),
            output: caps[2].to_string(),
        })
    } else {
        None
    }
}

/// Whether `value` still contains any unresolved reference.
pub fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => pattern().is_match(s),
        Value::Array(items) => items.iter().any(contains_reference),
        Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

/// Collect every reference in `value`, sorted and deduplicated.
pub fn find_references(value: &Value) -> BTreeSet<DependencyRef> {
    let mut found = BTreeSet::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut BTreeSet<DependencyRef>) {
    match value {
        Value::String(s) => {
            for caps in pattern().captures_iter(s) {
                found.insert(DependencyRef {
                    dependency: caps[1].to_string(),
                    output: caps[2].to_string(),
                });
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Replace every reference in `value` using `lookup`.
///
/// A whole-string reference takes the looked-up value with its type; an
/// embedded reference is stringified. Returns the first reference the
/// lookup could not satisfy.
pub fn substitute(
    value: &Value,
    lookup: &mut dyn FnMut(&DependencyRef) -> Option<Value>,
) -> Result<Value, DependencyRef> {
    match value {
        Value::String(s) => {
            if let Some(reference) = as_whole_reference(value) {
                return lookup(&reference).ok_or(reference);
            }
            if !pattern().is_match(s) {
                return Ok(value.clone());
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in pattern().captures_iter(s) {
                let Some(whole) = caps.get(0) else { continue };
                let reference = DependencyRef {
                    dependency: caps[1].to_string(),
                    output: caps[2].to_string(),
                };
                let resolved = lookup(&reference).ok_or_else(|| reference.clone())?;
                out.push_str(&s[last..whole.start()]);
                out.push_str(&stringify(&resolved));
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a value for embedding inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
