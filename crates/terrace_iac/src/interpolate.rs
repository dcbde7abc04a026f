//! Template expressions inside module definitions.
//!
//! Supported roots:
//!
//! - `${var.<input>}` with optional `.field` / `["key"]` / `[0]` navigation
//! - `${each.key}` and `${each.value...}` inside `for_each` templates
//! - `${env.name}`, `${env.region}`, `${env.account_id}`
//! - `${resource.<type>.<name>[<key>].<attribute>}`
//!
//! Resource attributes are only known after the resource is applied, so at
//! render time they are rewritten into canonical placeholders that
//! [`resolve_refs`] substitutes later.

use std::collections::BTreeSet;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use terrace_spec::models::Attributes;
use terrace_spec::reference::stringify;

use crate::renderer::EnvContext;

/// Reference to an attribute of another resource node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub address: String,
    pub attribute: String,
}

impl ResourceRef {
    /// Canonical placeholder text, parseable by [`resolve_refs`].
    pub fn placeholder(&self) -> String {
        format!("${{resource.{}.{}}}", self.address, self.attribute)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

/// Logical address of a resource node: `type.name` or `type.name["key"]`.
pub fn address(resource_type: &str, name: &str, key: Option<&str>) -> String {
    match key {
        Some(k) => format!("{}.{}[\"{}\"]", resource_type, name, k),
        None => format!("{}.{}", resource_type, name),
    }
}

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("expression pattern is valid"))
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{(resource\.[^}]*)\}").expect("placeholder pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Index {
    Key(String),
    Position(usize),
    EachKey,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Name(String),
    Index(Index),
}

fn parse_path(expr: &str) -> Result<Vec<Segment>, String> {
    let mut chars = expr.trim().chars().peekable();
    let mut segments = Vec::new();

    loop {
        let name = read_identifier(&mut chars);
        if name.is_empty() {
            return Err(format!("malformed expression `{}`", expr));
        }
        segments.push(Segment::Name(name));

        while chars.peek() == Some(&'[') {
            chars.next();
            segments.push(Segment::Index(read_index(&mut chars, expr)?));
        }

        match chars.next() {
            None => return Ok(segments),
            Some('.') => continue,
            Some(c) => return Err(format!("unexpected '{}' in expression `{}`", c, expr)),
        }
    }
}

fn read_identifier(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            chars.next();
        } else {
            break;
        }
    }
    out
}

fn read_index(chars: &mut Peekable<Chars<'_>>, expr: &str) -> Result<Index, String> {
    let unterminated = || format!("unterminated index in expression `{}`", expr);

    if chars.peek() == Some(&'"') {
        chars.next();
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some(c) => key.push(c),
                None => return Err(unterminated()),
            }
        }
        return match chars.next() {
            Some(']') => Ok(Index::Key(key)),
            _ => Err(unterminated()),
        };
    }

    let mut raw = String::new();
    loop {
        match chars.next() {
            Some(']') => break,
            Some(c) => raw.push(c),
            None => return Err(unterminated()),
        }
    }
    let raw = raw.trim();
    if raw == "each.key" {
        Ok(Index::EachKey)
    } else if let Ok(position) = raw.parse::<usize>() {
        Ok(Index::Position(position))
    } else {
        Err(format!("unsupported index `{}` in expression `{}`", raw, expr))
    }
}

/// Result of evaluating a template value.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub value: Value,
    /// Derived from a sensitive input.
    pub sensitive: bool,
    pub refs: BTreeSet<ResourceRef>,
}

enum Term {
    Known(Value),
    Ref(ResourceRef),
}

/// Everything an expression may read while rendering one node.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub vars: &'a Attributes,
    pub sensitive_vars: &'a BTreeSet<String>,
    pub env: &'a EnvContext,
    pub each: Option<(&'a str, &'a Value)>,
}

impl<'a> Scope<'a> {
    pub fn with_each(&self, key: &'a str, value: &'a Value) -> Scope<'a> {
        Scope {
            vars: self.vars,
            sensitive_vars: self.sensitive_vars,
            env: self.env,
            each: Some((key, value)),
        }
    }

    /// Evaluate every expression inside `value`.
    pub fn evaluate(&self, value: &Value) -> Result<Evaluated, String> {
        let mut sensitive = false;
        let mut refs = BTreeSet::new();
        let value = self.walk(value, &mut sensitive, &mut refs)?;
        Ok(Evaluated {
            value,
            sensitive,
            refs,
        })
    }

    fn walk(
        &self,
        value: &Value,
        sensitive: &mut bool,
        refs: &mut BTreeSet<ResourceRef>,
    ) -> Result<Value, String> {
        match value {
            Value::String(s) => self.interpolate(s, sensitive, refs),
            Value::Array(items) => items
                .iter()
                .map(|v| self.walk(v, sensitive, refs))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.walk(v, sensitive, refs)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn interpolate(
        &self,
        s: &str,
        sensitive: &mut bool,
        refs: &mut BTreeSet<ResourceRef>,
    ) -> Result<Value, String> {
        let pattern = expression_pattern();
        let matches: Vec<_> = pattern.captures_iter(s).collect();
        if matches.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        if let [only] = matches.as_slice() {
            if only.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
                return Ok(match self.term(&only[1], sensitive)? {
                    Term::Known(v) => v,
                    Term::Ref(r) => {
                        let text = r.placeholder();
                        refs.insert(r);
                        Value::String(text)
                    }
                });
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in &matches {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&s[last..whole.start()]);
            match self.term(&caps[1], sensitive)? {
                Term::Known(v) => out.push_str(&stringify(&v)),
                Term::Ref(r) => {
                    out.push_str(&r.placeholder());
                    refs.insert(r);
                }
            }
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    fn term(&self, expr: &str, sensitive: &mut bool) -> Result<Term, String> {
        let segments = parse_path(expr)?;
        let Some(Segment::Name(root)) = segments.first() else {
            return Err(format!("malformed expression `{}`", expr));
        };

        match root.as_str() {
            "var" => {
                let Some(Segment::Name(name)) = segments.get(1) else {
                    return Err(format!("`{}` must name an input", expr));
                };
                let value = self
                    .vars
                    .get(name)
                    .ok_or_else(|| format!("unknown input `{}`", name))?;
                if self.sensitive_vars.contains(name) {
                    *sensitive = true;
                }
                self.navigate(value, &segments[2..], expr).map(Term::Known)
            }
            "each" => {
                let (key, value) = self
                    .each
                    .ok_or_else(|| format!("`{}` used outside a for_each template", expr))?;
                match segments.get(1) {
                    Some(Segment::Name(n)) if n == "key" && segments.len() == 2 => {
                        Ok(Term::Known(Value::String(key.to_string())))
                    }
                    Some(Segment::Name(n)) if n == "value" => {
                        self.navigate(value, &segments[2..], expr).map(Term::Known)
                    }
                    _ => Err(format!("unsupported each expression `{}`", expr)),
                }
            }
            "env" => {
                let value = match segments.get(1) {
                    Some(Segment::Name(n)) if segments.len() == 2 => match n.as_str() {
                        "name" => Some(self.env.name.clone()),
                        "region" => Some(self.env.region.clone()),
                        "account_id" => self.env.account_id.clone(),
                        _ => None,
                    },
                    _ => None,
                };
                value
                    .map(|v| Term::Known(Value::String(v)))
                    .ok_or_else(|| format!("`{}` is not available", expr))
            }
            "resource" => self.resource_ref(&segments, expr).map(Term::Ref),
            "dependency" => Err(format!(
                "`{}` must be resolved before the module is rendered",
                expr
            )),
            other => Err(format!("unknown expression root `{}`", other)),
        }
    }

    fn resource_ref(&self, segments: &[Segment], expr: &str) -> Result<ResourceRef, String> {
        let each_key = self.each.map(|(k, _)| k);
        resource_ref_from(segments, each_key)
            .ok_or_else(|| format!("malformed resource reference `{}`", expr))
    }

    fn navigate(&self, value: &Value, path: &[Segment], expr: &str) -> Result<Value, String> {
        let mut current = value;
        for segment in path {
            let next = match segment {
                Segment::Name(name) | Segment::Index(Index::Key(name)) => current.get(name.as_str()),
                Segment::Index(Index::Position(i)) => current.get(*i),
                Segment::Index(Index::EachKey) => match self.each {
                    Some((key, _)) => current.get(key),
                    None => None,
                },
            };
            current = next.ok_or_else(|| format!("`{}` does not resolve to a value", expr))?;
        }
        Ok(current.clone())
    }
}

fn resource_ref_from(segments: &[Segment], each_key: Option<&str>) -> Option<ResourceRef> {
    let (Some(Segment::Name(rtype)), Some(Segment::Name(name))) = (segments.get(1), segments.get(2))
    else {
        return None;
    };
    let (key, rest) = match segments.get(3) {
        Some(Segment::Index(Index::Key(k))) => (Some(k.as_str()), &segments[4..]),
        Some(Segment::Index(Index::EachKey)) => (Some(each_key?), &segments[4..]),
        Some(Segment::Index(Index::Position(_))) => return None,
        _ => (None, &segments[3..]),
    };
    match rest {
        [Segment::Name(attribute)] => Some(ResourceRef {
            address: address(rtype, name, key),
            attribute: attribute.clone(),
        }),
        _ => None,
    }
}

fn parse_placeholder(expr: &str) -> Option<ResourceRef> {
    let segments = parse_path(expr).ok()?;
    resource_ref_from(&segments, None)
}

/// Every resource placeholder in `value`.
pub fn find_refs(value: &Value) -> BTreeSet<ResourceRef> {
    let mut found = BTreeSet::new();
    collect_refs(value, &mut found);
    found
}

fn collect_refs(value: &Value, found: &mut BTreeSet<ResourceRef>) {
    match value {
        Value::String(s) => {
            for caps in placeholder_pattern().captures_iter(s) {
                if let Some(r) = parse_placeholder(&caps[1]) {
                    found.insert(r);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, found)),
        _ => {}
    }
}

/// Substitute resource placeholders using `lookup`. A whole-string
/// placeholder keeps the looked-up value's type.
pub fn resolve_refs(
    value: &Value,
    lookup: &mut dyn FnMut(&ResourceRef) -> Option<Value>,
) -> Result<Value, ResourceRef> {
    match value {
        Value::String(s) => {
            let pattern = placeholder_pattern();
            let matches: Vec<_> = pattern.captures_iter(s).collect();
            if matches.is_empty() {
                return Ok(value.clone());
            }
            if let [only] = matches.as_slice() {
                if only.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
                    if let Some(r) = parse_placeholder(&only[1]) {
                        return lookup(&r).ok_or(r);
                    }
                }
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in &matches {
                let (Some(whole), Some(r)) = (caps.get(0), parse_placeholder(&caps[1])) else {
                    continue;
                };
                let resolved = lookup(&r).ok_or_else(|| r.clone())?;
                out.push_str(&s[last..whole.start()]);
                out.push_str(&stringify(&resolved));
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_refs(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_refs(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> EnvContext {
        EnvContext {
            name: "qa".to_string(),
            region: "us-east-1".to_string(),
            account_id: None,
        }
    }

    #[test]
    fn test_vars_env_and_each() {
        let vars: Attributes = [
            ("cidr".to_string(), json!("10.0.0.0/16")),
            ("subnets".to_string(), json!({"a": {"cidr": "10.0.1.0/24"}})),
        ]
        .into_iter()
        .collect();
        let sensitive = BTreeSet::new();
        let env = env();
        let scope = Scope {
            vars: &vars,
            sensitive_vars: &sensitive,
            env: &env,
            each: None,
        };
        let each_value = json!({"cidr": "10.0.1.0/24"});
        let scoped = scope.with_each("a", &each_value);

        let out = scoped
            .evaluate(&json!({
                "cidr_block": "${each.value.cidr}",
                "name": "${env.name}-${each.key}",
                "vpc_cidr": "${var.subnets[\"a\"].cidr}",
                "same": "${var.subnets[each.key].cidr}"
            }))
            .unwrap();
        assert_eq!(out.value["cidr_block"], json!("10.0.1.0/24"));
        assert_eq!(out.value["name"], json!("qa-a"));
        assert_eq!(out.value["vpc_cidr"], json!("10.0.1.0/24"));
        assert_eq!(out.value["same"], json!("10.0.1.0/24"));
        assert!(!out.sensitive);

        assert!(scope.evaluate(&json!("${each.key}")).is_err());
        assert!(scope.evaluate(&json!("${env.account_id}")).is_err());
        assert!(scope.evaluate(&json!("${var.missing}")).is_err());
    }

    #[test]
    fn test_resource_refs_become_placeholders() {
        let vars = Attributes::new();
        let sensitive = BTreeSet::new();
        let env = env();
        let scope = Scope {
            vars: &vars,
            sensitive_vars: &sensitive,
            env: &env,
            each: None,
        };
        let each_value = json!("a");
        let scoped = scope.with_each("a", &each_value);

        let out = scoped
            .evaluate(&json!({
                "vpc_id": "${resource.aws_vpc.main.id}",
                "subnet": "${resource.aws_subnet.private[each.key].id}",
                "label": "vpc:${resource.aws_vpc.main.id}"
            }))
            .unwrap();
        assert_eq!(out.value["subnet"], json!("${resource.aws_subnet.private[\"a\"].id}"));
        assert_eq!(out.refs.len(), 2);
        assert_eq!(find_refs(&out.value), out.refs);

        let resolved = resolve_refs(&out.value, &mut |r| match r.address.as_str() {
            "aws_vpc.main" => Some(json!("vpc-1")),
            _ => Some(json!("subnet-a")),
        })
        .unwrap();
        assert_eq!(resolved["vpc_id"], json!("vpc-1"));
        assert_eq!(resolved["subnet"], json!("subnet-a"));
        assert_eq!(resolved["label"], json!("vpc:vpc-1"));

        let missing = resolve_refs(&out.value, &mut |_| None).unwrap_err();
        assert_eq!(missing.attribute, "id");
    }

    #[test]
    fn test_sensitive_inputs_taint_results() {
        let vars: Attributes = [("password".to_string(), json!("hunter2"))]
            .into_iter()
            .collect();
        let sensitive: BTreeSet<String> = ["password".to_string()].into_iter().collect();
        let env = env();
        let scope = Scope {
            vars: &vars,
            sensitive_vars: &sensitive,
            env: &env,
            each: None,
        };
        let out = scope.evaluate(&json!("user:${var.password}")).unwrap();
        assert_eq!(out.value, json!("user:hunter2"));
        assert!(out.sensitive);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_path("var.x[").is_err());
        assert!(parse_path("var..x").is_err());
        assert!(parse_path("var.x[foo]").is_err());
        assert_eq!(
            parse_path("var.list[2]").unwrap().last(),
            Some(&Segment::Index(Index::Position(2)))
        );
    }
}
