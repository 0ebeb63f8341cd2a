//! Definition parsing, static validation, and the loader port.
//!
//! [`validate`] runs every check that can be made without executing
//! anything: document shape, step ids, schema declarations, condition
//! operators, transform syntax, the dependency graph, and the
//! response-reference map.

use std::collections::HashSet;
use std::sync::Arc;

use ratio_types::definition::{Definition, FieldSpec, PROTECTED_EXECUTION_IDS, StepDocument};

use crate::condition;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::reference::{self, RefContext, Reference, ReferenceError};
use crate::schema;
use crate::transform::parser;

/// Trait for loading definitions by path.
///
/// Implementations live in ratio-infra (e.g., `FsDefinitionLoader`). Loaded
/// definitions are validated.
pub trait DefinitionLoader: Send + Sync + 'static {
    fn load(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<Arc<Definition>, EngineError>> + Send;
}

/// Parse a JSON definition document.
pub fn parse_json(text: &str) -> Result<Definition, EngineError> {
    serde_json::from_str(text).map_err(|e| EngineError::InvalidDefinition(format!("invalid JSON: {e}")))
}

/// Parse a YAML definition document.
pub fn parse_yaml(text: &str) -> Result<Definition, EngineError> {
    serde_yaml_ng::from_str(text).map_err(|e| EngineError::InvalidDefinition(format!("invalid YAML: {e}")))
}

/// Validate a definition, recursing into inline step definitions.
pub fn validate(definition: &Definition) -> Result<(), EngineError> {
    let invalid = |msg: String| Err(EngineError::InvalidDefinition(msg));

    match (&definition.instructions, &definition.system_event_endpoint) {
        (Some(_), Some(_)) => {
            return invalid("definition declares both instructions and system_event_endpoint".to_string());
        }
        (None, None) => {
            return invalid("definition needs either instructions or system_event_endpoint".to_string());
        }
        (None, Some(endpoint)) if endpoint.trim().is_empty() => {
            return invalid("system_event_endpoint is empty".to_string());
        }
        _ => {}
    }

    validate_fields("argument", &definition.arguments)?;
    validate_fields("response", &definition.responses)?;

    if !definition.is_composite() {
        return Ok(());
    }

    let steps = definition.steps();
    let mut ids = HashSet::new();
    for step in steps {
        validate_step(step)?;
        if !ids.insert(step.execution_id.as_str()) {
            return invalid(format!("duplicate execution_id '{}'", step.execution_id));
        }
    }

    DependencyGraph::build(steps, &definition.arguments)?;
    validate_response_map(definition, &ids)?;
    Ok(())
}

fn validate_fields(kind: &str, fields: &[FieldSpec]) -> Result<(), EngineError> {
    let mut names = HashSet::new();
    for field in fields {
        if field.name.is_empty() {
            return Err(EngineError::InvalidDefinition(format!("{kind} with empty name")));
        }
        if !names.insert(field.name.as_str()) {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate {kind} '{}'",
                field.name
            )));
        }
        if let Some(pattern) = &field.regex_pattern {
            schema::compile_pattern(&field.name, pattern)
                .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        }
        if let Some(tree) = &field.required_conditions {
            condition::validate_tree(tree)?;
        }
    }
    Ok(())
}

fn validate_step(step: &StepDocument) -> Result<(), EngineError> {
    let id = &step.execution_id;
    let invalid = |msg: String| Err(EngineError::InvalidDefinition(msg));

    if id.is_empty() {
        return invalid("step with empty execution_id".to_string());
    }
    if PROTECTED_EXECUTION_IDS.contains(&id.as_str()) {
        return invalid(format!("execution_id '{id}' is reserved"));
    }
    if id.contains(['.', '[', ']']) || id.starts_with(reference::REF_PREFIX) {
        return invalid(format!("execution_id '{id}' contains reserved characters"));
    }

    match (&step.definition_path, &step.inline_definition) {
        (Some(_), Some(_)) => {
            return invalid(format!("step '{id}' has both definition_path and inline_definition"));
        }
        (None, None) => {
            return invalid(format!("step '{id}' needs definition_path or inline_definition"));
        }
        (None, Some(inline)) => validate(inline)?,
        (Some(_), None) => {}
    }

    if let Some(tree) = &step.conditions {
        condition::validate_tree(tree)?;
    }
    if let Some(parallel) = &step.parallel_execution {
        if parallel.child_argument_name.is_empty() {
            return invalid(format!("step '{id}' has an empty child_argument_name"));
        }
    }
    for block in [&step.transform_arguments, &step.transform_responses]
        .into_iter()
        .flatten()
    {
        for (key, expression) in &block.transforms {
            if !Reference::is_reference(expression) {
                parser::parse(expression).map_err(|e| {
                    EngineError::InvalidDefinition(format!("step '{id}' transform '{key}': {e}"))
                })?;
            }
        }
    }
    Ok(())
}

fn validate_response_map(definition: &Definition, ids: &HashSet<&str>) -> Result<(), EngineError> {
    let map = match &definition.response_reference_map {
        Some(map) => map,
        None if definition.responses.is_empty() => return Ok(()),
        None => {
            return Err(EngineError::InvalidDefinition(
                "responses are declared but response_reference_map is missing".to_string(),
            ));
        }
    };

    if let Some(missing) = definition
        .responses
        .iter()
        .find(|r| r.required && r.default_value.is_none() && !map.contains_key(&r.name))
    {
        return Err(EngineError::InvalidDefinition(format!(
            "response_reference_map does not cover required response '{}'",
            missing.name
        )));
    }

    let mut refs = Vec::new();
    for value in map.values() {
        reference::scan(value, &mut refs)?;
    }
    for r in refs {
        match &r.context {
            RefContext::Sibling(id) if !ids.contains(id.as_str()) => {
                return Err(ReferenceError::UnknownExecution(id.clone()).into());
            }
            RefContext::Execution if !ids.contains(r.key.as_str()) => {
                return Err(ReferenceError::UnknownExecution(r.key.clone()).into());
            }
            RefContext::Arguments
                if !definition.arguments.is_empty() && definition.argument(&r.key).is_none() =>
            {
                return Err(ReferenceError::UnknownKey {
                    context: "arguments".to_string(),
                    key: r.key.clone(),
                }
                .into());
            }
            RefContext::SelfPayload => return Err(ReferenceError::NoSelfPayload.into()),
            _ => {}
        }
    }
    Ok(())
}
