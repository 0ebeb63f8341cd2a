//! Argument and response schema validation.
//!
//! [`validate`] normalizes a payload against its field declarations:
//! defaults fill absent fields, conditional requiredness is evaluated against
//! sibling fields, values are type-checked (strings are promoted to file
//! references for `file` fields), and `enum` / `regex_pattern` constraints
//! are enforced. The output contains every declared field, null when an
//! optional field is absent, plus any undeclared extras untouched.

use std::collections::BTreeMap;

use ratio_types::definition::{FieldSpec, TypeName};
use ratio_types::value::{FileRef, Value, ValueKind};
use regex::Regex;
use thiserror::Error;

use crate::condition;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("missing required field '{0}'")]
    Missing(String),

    #[error("field '{field}' expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: TypeName,
        found: ValueKind,
    },

    #[error("field '{field}' value {value} is not one of the allowed values")]
    NotInEnum { field: String, value: String },

    #[error("field '{field}' does not match pattern '{pattern}'")]
    PatternMismatch { field: String, pattern: String },

    #[error("field '{field}' has invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        field: String,
        pattern: String,
        reason: String,
    },

    #[error("field '{field}' has invalid required_conditions: {reason}")]
    InvalidCondition { field: String, reason: String },
}

/// Validate and normalize `values` against `specs`.
pub fn validate(
    specs: &[FieldSpec],
    mut values: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, SchemaError> {
    // Defaults first, so conditional requiredness sees them.
    for spec in specs {
        let absent = values.get(&spec.name).is_none_or(Value::is_null);
        if absent {
            if let Some(default) = &spec.default_value {
                values.insert(spec.name.clone(), default.clone());
            }
        }
    }

    for spec in specs {
        let required = is_required(spec, &values)?;
        let value = values.remove(&spec.name).unwrap_or_default();

        if value.is_null() {
            if required {
                return Err(SchemaError::Missing(spec.name.clone()));
            }
            values.insert(spec.name.clone(), Value::Null);
            continue;
        }

        let value = check_type(spec, value)?;
        check_enum(spec, &value)?;
        check_pattern(spec, &value)?;
        values.insert(spec.name.clone(), value);
    }

    Ok(values)
}

fn is_required(spec: &FieldSpec, values: &BTreeMap<String, Value>) -> Result<bool, SchemaError> {
    let Some(tree) = &spec.required_conditions else {
        return Ok(spec.required);
    };
    // Params name sibling fields; values are literals.
    let field = |param: &Value| -> Option<Value> {
        match param {
            Value::String(name) => Some(values.get(name).cloned().unwrap_or_default()),
            _ => None,
        }
    };
    let literal = |value: &Value| Some(value.clone());
    condition::evaluate_with(tree, &field, &literal).map_err(|err| SchemaError::InvalidCondition {
        field: spec.name.clone(),
        reason: err.to_string(),
    })
}

fn check_type(spec: &FieldSpec, value: Value) -> Result<Value, SchemaError> {
    let mismatch = |found: ValueKind| SchemaError::TypeMismatch {
        field: spec.name.clone(),
        expected: spec.type_name,
        found,
    };
    match (spec.type_name, value) {
        (TypeName::Any, v) => Ok(v),
        (TypeName::String, v @ Value::String(_)) => Ok(v),
        (TypeName::Number, v @ Value::Number(_)) => Ok(v),
        (TypeName::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0) {
                Ok(Value::Number(n))
            } else {
                Err(mismatch(ValueKind::Number))
            }
        }
        (TypeName::Boolean, v @ Value::Bool(_)) => Ok(v),
        (TypeName::List, v @ Value::List(_)) => Ok(v),
        (TypeName::Object, v @ Value::Object(_)) => Ok(v),
        (TypeName::File, v @ Value::File(_)) => Ok(v),
        (TypeName::File, Value::String(path)) => Ok(Value::File(FileRef::new(path))),
        (_, other) => Err(mismatch(other.kind())),
    }
}

fn check_enum(spec: &FieldSpec, value: &Value) -> Result<(), SchemaError> {
    match &spec.enum_values {
        Some(allowed) if !allowed.contains(value) => Err(SchemaError::NotInEnum {
            field: spec.name.clone(),
            value: value.to_display_string(),
        }),
        _ => Ok(()),
    }
}

fn check_pattern(spec: &FieldSpec, value: &Value) -> Result<(), SchemaError> {
    let (Some(pattern), Value::String(text)) = (&spec.regex_pattern, value) else {
        return Ok(());
    };
    let re = compile_pattern(&spec.name, pattern)?;
    if re.is_match(text) {
        Ok(())
    } else {
        Err(SchemaError::PatternMismatch {
            field: spec.name.clone(),
            pattern: pattern.clone(),
        })
    }
}

/// Compile a `regex_pattern` anchored at both ends.
pub fn compile_pattern(field: &str, pattern: &str) -> Result<Regex, SchemaError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|err| SchemaError::InvalidPattern {
        field: field.to_string(),
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

/// Declared type that best describes an undeclared value.
pub fn infer_type(value: &Value) -> TypeName {
    match value {
        Value::Null => TypeName::Any,
        Value::Bool(_) => TypeName::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => TypeName::Integer,
        Value::Number(_) => TypeName::Number,
        Value::String(_) => TypeName::String,
        Value::List(_) => TypeName::List,
        Value::Object(_) => TypeName::Object,
        Value::File(_) => TypeName::File,
    }
}

#[cfg(test)]
mod tests {
    use ratio_types::condition::ConditionTree;
    use serde_json::json;

    use super::*;
    use crate::reference::testing::object;

    fn spec(name: &str, type_name: TypeName) -> FieldSpec {
        FieldSpec::new(name, type_name)
    }

    #[test]
    fn fills_defaults_and_nulls() {
        let specs = vec![
            spec("limit", TypeName::Integer).optional().with_default(10_i64),
            spec("note", TypeName::String).optional(),
        ];
        let out = validate(&specs, BTreeMap::new()).unwrap();
        assert_eq!(out["limit"], Value::from(10_i64));
        assert_eq!(out["note"], Value::Null);
    }

    #[test]
    fn missing_required_field() {
        let specs = vec![spec("url", TypeName::String)];
        assert_eq!(
            validate(&specs, BTreeMap::new()),
            Err(SchemaError::Missing("url".to_string()))
        );
    }

    #[test]
    fn type_mismatch_reports_kind() {
        let specs = vec![spec("count", TypeName::Integer)];
        let err = validate(&specs, object(json!({"count": "three"}))).unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                field: "count".to_string(),
                expected: TypeName::Integer,
                found: ValueKind::String,
            }
        );
        assert!(validate(&specs, object(json!({"count": 2.5}))).is_err());
        assert!(validate(&specs, object(json!({"count": 2.0}))).is_ok());
    }

    #[test]
    fn file_fields_promote_strings() {
        let specs = vec![spec("doc", TypeName::File)];
        let out = validate(&specs, object(json!({"doc": "/a/b.txt"}))).unwrap();
        assert_eq!(out["doc"], Value::File(FileRef::new("/a/b.txt")));
    }

    #[test]
    fn enum_and_pattern_constraints() {
        let mut mode = spec("mode", TypeName::String);
        mode.enum_values = Some(vec![Value::from("fast"), Value::from("safe")]);
        let mut code = spec("code", TypeName::String);
        code.regex_pattern = Some("[A-Z]{3}".to_string());
        let specs = vec![mode, code];

        assert!(validate(&specs, object(json!({"mode": "fast", "code": "ABC"}))).is_ok());
        assert!(matches!(
            validate(&specs, object(json!({"mode": "slow", "code": "ABC"}))),
            Err(SchemaError::NotInEnum { .. })
        ));
        assert!(matches!(
            validate(&specs, object(json!({"mode": "fast", "code": "ABCD"}))),
            Err(SchemaError::PatternMismatch { .. })
        ));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(matches!(
            compile_pattern("f", "(unclosed"),
            Err(SchemaError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn required_conditions_gate_requiredness() {
        let mut path = spec("arguments_path", TypeName::String);
        path.required_conditions = Some(
            serde_json::from_value::<ConditionTree>(json!({
                "param": "source", "operator": "equals", "value": "file"
            }))
            .unwrap(),
        );
        let specs = vec![spec("source", TypeName::String), path];

        assert!(validate(&specs, object(json!({"source": "inline"}))).is_ok());
        assert_eq!(
            validate(&specs, object(json!({"source": "file"}))),
            Err(SchemaError::Missing("arguments_path".to_string()))
        );
    }

    #[test]
    fn extras_are_kept_and_inferred() {
        let out = validate(&[], object(json!({"extra": [1]}))).unwrap();
        assert_eq!(infer_type(&out["extra"]), TypeName::List);
        assert_eq!(infer_type(&Value::from(1_i64)), TypeName::Integer);
        assert_eq!(infer_type(&Value::from_f64(1.5)), TypeName::Number);
    }
}
