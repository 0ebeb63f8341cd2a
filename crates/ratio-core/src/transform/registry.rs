//! Function registry: name to typed handler, with call-time argument binding.

use std::collections::{BTreeMap, HashMap, HashSet};

use ratio_types::value::Value;

use super::{FunctionContext, TransformError};

/// A builtin implementation. Receives its bound arguments.
pub type Handler = fn(&mut Args, &FunctionContext<'_>) -> Result<Value, TransformError>;

/// One declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub required: bool,
}

impl Param {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self { name, required: false }
    }
}

/// Registration record for one function.
#[derive(Clone)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub params: &'static [Param],
    /// Keywords outside `params` are collected instead of rejected.
    pub accepts_extra_keywords: bool,
    pub handler: Handler,
}

impl std::fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("accepts_extra_keywords", &self.accepts_extra_keywords)
            .finish()
    }
}

/// Names the evaluator handles itself.
const RESERVED: &[&str] = &["pipeline"];

#[derive(Debug, Default, Clone)]
pub struct Registry {
    functions: HashMap<&'static str, FunctionSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin catalog.
    pub fn with_builtins() -> Result<Self, TransformError> {
        let mut registry = Self::new();
        for spec in super::builtins::catalog() {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Add a function. Names must be unique, parameter names unique, and
    /// required parameters must precede optional ones.
    pub fn register(&mut self, spec: FunctionSpec) -> Result<(), TransformError> {
        if RESERVED.contains(&spec.name) || self.functions.contains_key(spec.name) {
            return Err(TransformError::Registry(format!(
                "function '{}' is already defined",
                spec.name
            )));
        }
        let mut seen = HashSet::new();
        let mut optional_seen = false;
        for param in spec.params {
            if !seen.insert(param.name) {
                return Err(TransformError::Registry(format!(
                    "function '{}' declares parameter '{}' twice",
                    spec.name, param.name
                )));
            }
            if param.required && optional_seen {
                return Err(TransformError::Registry(format!(
                    "function '{}': required parameter '{}' follows an optional one",
                    spec.name, param.name
                )));
            }
            optional_seen |= !param.required;
        }
        self.functions.insert(spec.name, spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        RESERVED.contains(&name) || self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Argument binding
// ---------------------------------------------------------------------------

/// Arguments bound to a function's declared parameters.
#[derive(Debug)]
pub struct Args {
    function: &'static str,
    bound: BTreeMap<&'static str, Value>,
    extra: BTreeMap<String, Value>,
}

impl Args {
    /// Bind evaluated positional and keyword arguments to `spec`.
    pub fn bind(
        spec: &FunctionSpec,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Result<Self, TransformError> {
        let err = |reason: String| TransformError::Arguments {
            function: spec.name.to_string(),
            reason,
        };

        if positional.len() > spec.params.len() {
            return Err(err(format!(
                "takes at most {} positional arguments, got {}",
                spec.params.len(),
                positional.len()
            )));
        }

        let mut bound = BTreeMap::new();
        for (param, value) in spec.params.iter().zip(positional) {
            bound.insert(param.name, value);
        }

        let mut extra = BTreeMap::new();
        for (name, value) in keywords {
            match spec.params.iter().find(|p| p.name == name) {
                Some(param) => {
                    if bound.insert(param.name, value).is_some() {
                        return Err(err(format!("argument '{name}' given more than once")));
                    }
                }
                None if spec.accepts_extra_keywords => {
                    if extra.insert(name.clone(), value).is_some() {
                        return Err(err(format!("argument '{name}' given more than once")));
                    }
                }
                None => return Err(err(format!("unexpected keyword argument '{name}'"))),
            }
        }

        if let Some(missing) = spec
            .params
            .iter()
            .find(|p| p.required && !bound.contains_key(p.name))
        {
            return Err(err(format!("missing required argument '{}'", missing.name)));
        }

        Ok(Self {
            function: spec.name,
            bound,
            extra,
        })
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    /// Error for this function with a free-form reason.
    pub fn fail(&self, reason: impl Into<String>) -> TransformError {
        TransformError::Function {
            function: self.function.to_string(),
            reason: reason.into(),
        }
    }

    /// Take a required argument. Binding already guaranteed presence.
    pub fn take(&mut self, name: &'static str) -> Value {
        self.bound.remove(name).unwrap_or_default()
    }

    /// Take an optional argument; null counts as absent.
    pub fn take_optional(&mut self, name: &'static str) -> Option<Value> {
        self.bound.remove(name).filter(|v| !v.is_null())
    }

    pub fn take_list(&mut self, name: &'static str) -> Result<Vec<Value>, TransformError> {
        match self.take(name) {
            Value::List(items) => Ok(items),
            other => Err(self.fail(format!("'{name}' must be a list, got {}", other.kind()))),
        }
    }

    pub fn take_string(&mut self, name: &'static str) -> Result<String, TransformError> {
        match self.take(name) {
            Value::String(s) => Ok(s),
            other => Err(self.fail(format!("'{name}' must be a string, got {}", other.kind()))),
        }
    }

    pub fn take_optional_string(
        &mut self,
        name: &'static str,
    ) -> Result<Option<String>, TransformError> {
        match self.take_optional(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.fail(format!(
                "'{name}' must be a string, got {}",
                other.kind()
            ))),
        }
    }

    /// Keyword arguments outside the declared parameters.
    pub fn take_extra(&mut self) -> BTreeMap<String, Value> {
        std::mem::take(&mut self.extra)
    }
}
