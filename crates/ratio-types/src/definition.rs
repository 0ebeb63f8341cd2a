//! Definition and step documents.
//!
//! A [`Definition`] is the file-level unit of work. It declares its argument
//! and response schemas and is either a *primitive* (bound to an external
//! executor endpoint) or a *composite* (an ordered list of [`StepDocument`]s
//! plus a response-reference map). Documents are read from JSON or YAML.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::ConditionTree;
use crate::value::Value;

/// Reference contexts that can never be used as an `execution_id`.
pub const PROTECTED_EXECUTION_IDS: [&str; 3] = ["arguments", "self", "execution"];

/// A definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub arguments: Vec<FieldSpec>,

    #[serde(default)]
    pub responses: Vec<FieldSpec>,

    /// Present for composites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Vec<StepDocument>>,

    /// Present for primitives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_event_endpoint: Option<String>,

    /// `{response_name: reference_or_literal}`, resolved at the fixed point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_reference_map: Option<BTreeMap<String, Value>>,
}

/// Borrowed view of what a definition executes.
#[derive(Debug, Clone, Copy)]
pub enum DefinitionBody<'a> {
    Primitive { endpoint: &'a str },
    Composite {
        steps: &'a [StepDocument],
        response_map: Option<&'a BTreeMap<String, Value>>,
    },
}

impl Definition {
    /// Classify the definition. A definition without an endpoint is composite.
    pub fn body(&self) -> DefinitionBody<'_> {
        match &self.system_event_endpoint {
            Some(endpoint) => DefinitionBody::Primitive { endpoint },
            None => DefinitionBody::Composite {
                steps: self.instructions.as_deref().unwrap_or(&[]),
                response_map: self.response_reference_map.as_ref(),
            },
        }
    }

    pub fn is_composite(&self) -> bool {
        self.system_event_endpoint.is_none()
    }

    pub fn steps(&self) -> &[StepDocument] {
        self.instructions.as_deref().unwrap_or(&[])
    }

    pub fn argument(&self, name: &str) -> Option<&FieldSpec> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn response(&self, name: &str) -> Option<&FieldSpec> {
        self.responses.iter().find(|r| r.name == name)
    }
}

/// One argument or response field declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(default)]
    pub type_name: TypeName,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_pattern: Option<String>,

    /// When set, the field is only required while this tree holds. Predicate
    /// params name sibling fields of the same payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_conditions: Option<ConditionTree>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    /// Shorthand used by tests and programmatic definitions.
    pub fn new(name: impl Into<String>, type_name: TypeName) -> Self {
        Self {
            name: name.into(),
            type_name,
            required: true,
            description: String::new(),
            default_value: None,
            enum_values: None,
            regex_pattern: None,
            required_conditions: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Declared type of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeName {
    String,
    Number,
    Integer,
    Boolean,
    #[serde(alias = "array")]
    List,
    #[serde(alias = "dict", alias = "map")]
    Object,
    File,
    #[default]
    Any,
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeName::String => "string",
            TypeName::Number => "number",
            TypeName::Integer => "integer",
            TypeName::Boolean => "boolean",
            TypeName::List => "list",
            TypeName::Object => "object",
            TypeName::File => "file",
            TypeName::Any => "any",
        };
        f.write_str(s)
    }
}

/// One entry of a composite's `instructions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDocument {
    pub execution_id: String,

    #[serde(
        default,
        alias = "agent_definition_path",
        skip_serializing_if = "Option::is_none"
    )]
    pub definition_path: Option<String>,

    #[serde(
        default,
        alias = "agent_definition",
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_definition: Option<Box<Definition>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionTree>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_execution: Option<ParallelExecution>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_arguments: Option<TransformBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_responses: Option<TransformBlock>,
}

impl StepDocument {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            definition_path: None,
            inline_definition: None,
            arguments: BTreeMap::new(),
            conditions: None,
            dependencies: Vec::new(),
            parallel_execution: None,
            transform_arguments: None,
            transform_responses: None,
        }
    }

    /// Human-readable name of the target definition for logs.
    pub fn target_label(&self) -> &str {
        match &self.definition_path {
            Some(path) => path,
            None => "<inline>",
        }
    }
}

/// Fan-out of a step over a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelExecution {
    /// A `REF:` string or a literal list.
    pub iterate_over: Value,
    pub child_argument_name: String,
}

/// A `transform_arguments` / `transform_responses` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformBlock {
    /// Phase one: names bound to references or literals.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Phase two: output keys bound to expressions.
    #[serde(default)]
    pub transforms: BTreeMap<String, String>,
}
