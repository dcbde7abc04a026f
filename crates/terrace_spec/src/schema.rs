//! Variable schema validation.
//!
//! Checks a candidate input set against a module's declared input schema and
//! returns the inputs coerced to canonical types with defaults filled in.
//! Conversion follows the usual Terraform rules: numbers and bools convert to
//! strings, numeric strings convert to numbers and `"true"`/`"false"` convert
//! to bools. Every problem in the input set is reported, not only the first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::models::{Attributes, FieldSpec, FieldType, Secret};
use crate::reference;

/// Why a field failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaErrorKind {
    TypeMismatch,
    MissingRequired,
    UnknownField,
}

/// A single validation failure naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaError {
    pub path: String,
    pub kind: SchemaErrorKind,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SchemaErrorKind::TypeMismatch => write!(
                f,
                "field `{}`: expected {}, found {}",
                self.path, self.expected, self.found
            ),
            SchemaErrorKind::MissingRequired => write!(
                f,
                "field `{}`: required {} is missing",
                self.path, self.expected
            ),
            SchemaErrorKind::UnknownField => {
                write!(f, "field `{}`: not declared in schema", self.path)
            }
        }
    }
}

/// Validator for one module's input schema.
pub struct SchemaValidator<'a> {
    fields: &'a BTreeMap<String, FieldSpec>,
    allow_references: bool,
    sensitive: Option<&'a BTreeSet<String>>,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(fields: &'a BTreeMap<String, FieldSpec>) -> Self {
        Self {
            fields,
            allow_references: false,
            sensitive: None,
        }
    }

    /// Top-level inputs whose values must never appear in errors, on top of
    /// fields the schema marks `sensitive`.
    pub fn with_sensitive(mut self, names: &'a BTreeSet<String>) -> Self {
        self.sensitive = Some(names);
        self
    }

    /// Accept unresolved dependency references in place of any type.
    ///
    /// Used for the structural pass that runs before dependency outputs exist.
    pub fn allow_references(mut self, allow: bool) -> Self {
        self.allow_references = allow;
        self
    }

    /// Validate and coerce `inputs`.
    pub fn validate(&self, inputs: &Attributes) -> Result<Attributes, Vec<SchemaError>> {
        let mut errors = Vec::new();
        let object: serde_json::Map<String, Value> =
            inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let coerced = self.check_object(self.fields, &object, "", false, &mut errors);

        if errors.is_empty() {
            Ok(coerced.into_iter().collect())
        } else {
            Err(errors)
        }
    }

    fn check_object(
        &self,
        fields: &BTreeMap<String, FieldSpec>,
        object: &serde_json::Map<String, Value>,
        path: &str,
        hidden: bool,
        errors: &mut Vec<SchemaError>,
    ) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();

        for (name, spec) in fields {
            let field_path = join(path, name);
            let hidden = hidden || spec.sensitive || (path.is_empty() && self.is_sensitive(name));
            match object.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if let Some(v) =
                        self.check(&spec.field_type, value, &field_path, hidden, errors)
                    {
                        out.insert(name.clone(), v);
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        if let Some(v) =
                            self.check(&spec.field_type, default, &field_path, hidden, errors)
                        {
                            out.insert(name.clone(), v);
                        }
                    } else if spec.is_required() {
                        errors.push(SchemaError {
                            path: field_path,
                            kind: SchemaErrorKind::MissingRequired,
                            expected: spec.field_type.describe(),
                            found: "nothing".to_string(),
                        });
                    }
                }
            }
        }

        for name in object.keys() {
            if !fields.contains_key(name) {
                errors.push(SchemaError {
                    path: join(path, name),
                    kind: SchemaErrorKind::UnknownField,
                    expected: String::new(),
                    found: type_name(&object[name]).to_string(),
                });
            }
        }

        out
    }

    fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive.is_some_and(|names| names.contains(name))
    }

    fn check(
        &self,
        field_type: &FieldType,
        value: &Value,
        path: &str,
        hidden: bool,
        errors: &mut Vec<SchemaError>,
    ) -> Option<Value> {
        if self.allow_references && reference::as_whole_reference(value).is_some() {
            return Some(value.clone());
        }

        let coerced = match (field_type, value) {
            (FieldType::Any, v) => Some(v.clone()),

            (FieldType::String, Value::String(_)) => Some(value.clone()),
            (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

            (FieldType::Number, Value::Number(_)) => Some(value.clone()),
            (FieldType::Number, Value::String(s)) => parse_number(s),

            (FieldType::Bool, Value::Bool(_)) => Some(value.clone()),
            (FieldType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },

            (FieldType::List { items }, Value::Array(values)) => {
                let checked = values
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| {
                        self.check(items, v, &format!("{}[{}]", path, i), hidden, errors)
                    })
                    .collect();
                return Some(Value::Array(checked));
            }

            (FieldType::Map { values }, Value::Object(map)) => {
                let mut out = serde_json::Map::new();
                for (key, v) in map {
                    if let Some(checked) = self.check(values, v, &join(path, key), hidden, errors) {
                        out.insert(key.clone(), checked);
                    }
                }
                return Some(Value::Object(out));
            }

            (FieldType::Object { fields }, Value::Object(map)) => {
                return Some(Value::Object(self.check_object(fields, map, path, hidden, errors)));
            }

            _ => None,
        };

        if coerced.is_none() {
            errors.push(SchemaError {
                path: path.to_string(),
                kind: SchemaErrorKind::TypeMismatch,
                expected: field_type.describe(),
                found: if hidden {
                    format!("{} {}", type_name(value), Secret::REDACTED)
                } else {
                    describe_value(value)
                },
            });
        }
        coerced
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::Number(Number::from(i)));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

/// Short JSON type name of a value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("string \"{}\"", s),
        other => type_name(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn security_group_schema() -> BTreeMap<String, FieldSpec> {
        let rule = FieldType::Object {
            fields: BTreeMap::from([
                ("from_port".to_string(), FieldSpec::new(FieldType::Number)),
                ("to_port".to_string(), FieldSpec::new(FieldType::Number)),
                (
                    "protocol".to_string(),
                    FieldSpec::new(FieldType::String).with_default(json!("tcp")),
                ),
                (
                    "cidr_blocks".to_string(),
                    FieldSpec::new(FieldType::List {
                        items: Box::new(FieldType::String),
                    })
                    .optional(),
                ),
            ]),
        };
        let group = FieldType::Object {
            fields: BTreeMap::from([
                ("description".to_string(), FieldSpec::new(FieldType::String)),
                (
                    "ingress".to_string(),
                    FieldSpec::new(FieldType::List {
                        items: Box::new(rule),
                    })
                    .with_default(json!([])),
                ),
            ]),
        };
        BTreeMap::from([
            ("vpc_id".to_string(), FieldSpec::new(FieldType::String)),
            (
                "enable_flow_logs".to_string(),
                FieldSpec::new(FieldType::Bool).with_default(json!(false)),
            ),
            (
                "security_groups".to_string(),
                FieldSpec::new(FieldType::Map {
                    values: Box::new(group),
                }),
            ),
        ])
    }

    fn to_attrs(value: Value) -> Attributes {
        value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nested_defaults_and_coercion() {
        let schema = security_group_schema();
        let inputs = to_attrs(json!({
            "vpc_id": "vpc-1",
            "security_groups": {
                "web": {
                    "description": "web tier",
                    "ingress": [{"from_port": "443", "to_port": 443}]
                }
            }
        }));

        let out = SchemaValidator::new(&schema).validate(&inputs).unwrap();
        assert_eq!(out["enable_flow_logs"], json!(false));
        let rule = &out["security_groups"]["web"]["ingress"][0];
        assert_eq!(rule["from_port"], json!(443));
        assert_eq!(rule["protocol"], json!("tcp"));
        assert!(rule.get("cidr_blocks").is_none());
    }

    #[test]
    fn test_errors_name_the_field() {
        let schema = security_group_schema();
        let inputs = to_attrs(json!({
            "vpc_id": ["not", "a", "string"],
            "security_groups": {
                "db": {
                    "description": "db tier",
                    "ingress": [{"from_port": "postgres", "to_port": 5432}],
                    "egress": []
                }
            },
            "colour": "blue"
        }));

        let errors = SchemaValidator::new(&schema).validate(&inputs).unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"vpc_id"));
        assert!(paths.contains(&"security_groups.db.ingress[0].from_port"));
        assert!(paths.contains(&"security_groups.db.egress"));
        assert!(paths.contains(&"colour"));

        let port = errors
            .iter()
            .find(|e| e.path.ends_with("from_port"))
            .unwrap();
        assert_eq!(port.kind, SchemaErrorKind::TypeMismatch);
        assert_eq!(port.expected, "number");
    }

    #[test]
    fn test_missing_required_field() {
        let schema = security_group_schema();
        let errors = SchemaValidator::new(&schema)
            .validate(&to_attrs(json!({"vpc_id": "vpc-1"})))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, SchemaErrorKind::MissingRequired);
        assert_eq!(errors[0].path, "security_groups");
        assert_eq!(errors[0].expected, "map(object)");
    }

    #[test]
    fn test_references_allowed_only_when_enabled() {
        let schema = security_group_schema();
        let inputs = to_attrs(json!({
            "vpc_id": "${dependency.vpc.outputs.vpc_id}",
            "enable_flow_logs": "${dependency.vpc.outputs.flow_logs}",
            "security_groups": {}
        }));

        assert!(SchemaValidator::new(&schema)
            .allow_references(true)
            .validate(&inputs)
            .is_ok());

        let errors = SchemaValidator::new(&schema).validate(&inputs).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "enable_flow_logs");
    }

    #[test]
    fn test_sensitive_values_stay_out_of_errors() {
        let schema = BTreeMap::from([
            ("db_port".to_string(), FieldSpec::new(FieldType::Number)),
            (
                "credentials".to_string(),
                FieldSpec::new(FieldType::Object {
                    fields: BTreeMap::from([(
                        "pin".to_string(),
                        FieldSpec::new(FieldType::Number),
                    )]),
                })
                .sensitive(),
            ),
            ("label".to_string(), FieldSpec::new(FieldType::Number)),
        ]);
        let inputs = to_attrs(json!({
            "db_port": "hunter2-topsecret",
            "credentials": {"pin": "open-sesame"},
            "label": "plain-value"
        }));
        let secrets: BTreeSet<String> = ["db_port".to_string()].into_iter().collect();

        let errors = SchemaValidator::new(&schema)
            .with_sensitive(&secrets)
            .validate(&inputs)
            .unwrap_err();
        assert_eq!(errors.len(), 3);
        let text = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(!text.contains("hunter2-topsecret"), "{}", text);
        assert!(!text.contains("open-sesame"), "{}", text);
        assert!(text.contains("plain-value"));

        let port = errors.iter().find(|e| e.path == "db_port").unwrap();
        assert_eq!(port.found, "string <sensitive>");
        assert!(errors.iter().any(|e| e.path == "credentials.pin"));
    }
}
