//! Expression evaluation against a merged context.

use std::collections::BTreeMap;

use ratio_types::value::Value;

use super::parser::{self, Arg, Call, Expr, Path, Segment};
use super::registry::{Args, Registry};
use super::{FunctionContext, TransformError};

/// Name bound to the running value inside `pipeline`.
const CURRENT: &str = "current";

/// Evaluates parsed expressions with a registry and function context.
pub struct Evaluator<'a> {
    registry: &'a Registry,
    ctx: &'a FunctionContext<'a>,
}

/// Variable lookup: the merged context plus the pipeline's `current`.
struct Scope<'s> {
    context: &'s BTreeMap<String, Value>,
    current: Option<&'s Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: &'a Registry, ctx: &'a FunctionContext<'a>) -> Self {
        Self { registry, ctx }
    }

    /// Parse and evaluate one expression string.
    pub fn evaluate_str(
        &self,
        source: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<Value, TransformError> {
        let expr = parser::parse(source)?;
        self.evaluate(&expr, context)
    }

    pub fn evaluate(
        &self,
        expr: &Expr,
        context: &BTreeMap<String, Value>,
    ) -> Result<Value, TransformError> {
        self.eval(expr, &Scope { context, current: None })
    }

    fn eval(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, TransformError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => lookup(path, scope),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Object(entries) => entries
                .iter()
                .map(|(k, e)| Ok((k.clone(), self.eval(e, scope)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
            Expr::Call(call) if call.name == "pipeline" => self.pipeline(call, scope),
            Expr::Call(call) => self.call(call, scope),
        }
    }

    fn call(&self, call: &Call, scope: &Scope<'_>) -> Result<Value, TransformError> {
        let spec = self
            .registry
            .get(&call.name)
            .ok_or_else(|| TransformError::UnknownFunction(call.name.clone()))?;

        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        for arg in &call.args {
            match arg {
                Arg::Positional(e) => positional.push(self.eval(e, scope)?),
                Arg::Keyword(name, e) => keywords.push((name.clone(), self.eval(e, scope)?)),
            }
        }

        let mut args = Args::bind(spec, positional, keywords)?;
        (spec.handler)(&mut args, self.ctx)
    }

    /// `pipeline(seed, [op, ...])`: each op sees the previous result as
    /// `current`.
    fn pipeline(&self, call: &Call, scope: &Scope<'_>) -> Result<Value, TransformError> {
        let err = |reason: &str| TransformError::Arguments {
            function: "pipeline".to_string(),
            reason: reason.to_string(),
        };

        let mut seed = None;
        let mut operations = None;
        for (i, arg) in call.args.iter().enumerate() {
            let (slot, expr) = match arg {
                Arg::Positional(e) if i == 0 => (&mut seed, e),
                Arg::Positional(e) if i == 1 => (&mut operations, e),
                Arg::Keyword(name, e) if name == "initial_value" || name == "seed" => (&mut seed, e),
                Arg::Keyword(name, e) if name == "operations" => (&mut operations, e),
                Arg::Positional(_) => return Err(err("takes exactly 2 arguments")),
                Arg::Keyword(name, _) => {
                    return Err(err(&format!("unexpected keyword argument '{name}'")));
                }
            };
            if slot.replace(expr).is_some() {
                return Err(err("argument given more than once"));
            }
        }
        let seed = seed.ok_or_else(|| err("missing seed value"))?;
        let Some(Expr::List(operations)) = operations else {
            return Err(err("operations must be a list literal"));
        };

        let mut current = self.eval(seed, scope)?;
        for (step, op) in operations.iter().enumerate() {
            let inner = Scope {
                context: scope.context,
                current: Some(&current),
            };
            current = self.eval(op, &inner).map_err(|e| TransformError::Function {
                function: "pipeline".to_string(),
                reason: format!("step {step} failed: {e}"),
            })?;
        }
        Ok(current)
    }
}

fn lookup(path: &Path, scope: &Scope<'_>) -> Result<Value, TransformError> {
    let unknown = || TransformError::UnknownPath(path.to_string());

    let root = match scope.current {
        Some(current) if path.root == CURRENT => current,
        _ => scope.context.get(&path.root).ok_or_else(unknown)?,
    };

    let mut value = root;
    for segment in &path.segments {
        value = match (value, segment) {
            (Value::Object(map), Segment::Key(k)) => map.get(k).ok_or_else(unknown)?,
            (Value::List(items), Segment::Index(i)) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                usize::try_from(idx)
                    .ok()
                    .and_then(|idx| items.get(idx))
                    .ok_or_else(unknown)?
            }
            _ => return Err(unknown()),
        };
    }
    Ok(value.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::reference::testing::object;
    use crate::storage::FileAccess;
    use crate::transform::TransformLimits;

    fn eval(source: &str, context: serde_json::Value) -> Result<Value, TransformError> {
        let registry = Registry::with_builtins()?;
        let files = FileAccess::none();
        let ctx = FunctionContext {
            files: &files,
            limits: TransformLimits::default(),
        };
        Evaluator::new(&registry, &ctx).evaluate_str(source, &object(context))
    }

    #[test]
    fn pipeline_threads_current() {
        let out = eval(
            r#"pipeline(api_body, [json_parse(json_string=current), get_object_property(obj=current, property_path="user.name")])"#,
            json!({"api_body": r#"{"user":{"name":"Ada"}}"#}),
        )
        .unwrap();
        assert_eq!(out, Value::from("Ada"));
    }

    #[test]
    fn pipeline_steps_see_context_too() {
        let out = eval(
            "pipeline(items, [filter(current, 'item.n > 1'), join(map(current, 'item.name'), sep)])",
            json!({"items": [{"n": 1, "name": "a"}, {"n": 2, "name": "b"}, {"n": 3, "name": "c"}], "sep": "+"}),
        )
        .unwrap();
        assert_eq!(out, Value::from("b+c"));
    }

    #[test]
    fn pipeline_argument_errors() {
        assert!(eval("pipeline(x)", json!({"x": 1})).is_err());
        assert!(eval("pipeline(x, y)", json!({"x": 1, "y": []})).is_err());
        assert!(eval("pipeline(x, [unique(current)], 3)", json!({"x": [1]})).is_err());
    }

    #[test]
    fn pipeline_step_failure_names_step() {
        let err = eval("pipeline(x, [json_parse(current)])", json!({"x": 5})).unwrap_err();
        assert!(err.to_string().contains("step 0"), "{err}");
    }

    #[test]
    fn bare_paths_and_literals_evaluate() {
        let ctx = json!({"data": {"items": [10, 20, 30]}});
        assert_eq!(eval("data.items[1]", ctx.clone()).unwrap(), Value::from(20_i64));
        assert_eq!(eval("data.items.2", ctx.clone()).unwrap(), Value::from(30_i64));
        assert_eq!(eval("data.items[-1]", ctx.clone()).unwrap(), Value::from(30_i64));
        assert_eq!(eval("[1, 'a']", ctx.clone()).unwrap(), Value::from(json!([1, "a"])));
        assert!(matches!(
            eval("data.items[9]", ctx.clone()),
            Err(TransformError::UnknownPath(_))
        ));
        assert!(matches!(eval("data.nope", ctx), Err(TransformError::UnknownPath(_))));
    }

    #[test]
    fn current_outside_pipeline_is_a_context_name() {
        assert_eq!(eval("current", json!({"current": 7})).unwrap(), Value::from(7_i64));
        assert!(eval("current", json!({})).is_err());
    }

    #[test]
    fn unknown_function() {
        assert_eq!(
            eval("explode(1)", json!({})),
            Err(TransformError::UnknownFunction("explode".to_string()))
        );
    }

    #[test]
    fn nested_calls_and_object_literals() {
        let out = eval(
            r#"create_object(total=sum(items, 'item.qty'), names={"first": get_object_property(items, '0.name')})"#,
            json!({"items": [{"qty": 2, "name": "x"}, {"qty": 3, "name": "y"}]}),
        )
        .unwrap();
        assert_eq!(out, Value::from(json!({"total": 5, "names": {"first": "x"}})));
    }
}
