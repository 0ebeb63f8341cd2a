//! The builtin function catalog.
//!
//! Handlers take their bound [`Args`] and return a value; every failure is a
//! [`TransformError`]. Per-element key paths use the `item.<key>` form.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use ratio_types::value::Value;

use super::registry::{Args, FunctionSpec, Param};
use super::{FunctionContext, TransformError, files, filter};

/// Every builtin, data and storage.
pub(super) fn catalog() -> Vec<FunctionSpec> {
    let mut specs = vec![
        spec("get_object_property", const { &[Param::required("obj"), Param::required("property_path")] }, get_object_property),
        spec("json_parse", const { &[Param::required("json_string")] }, json_parse),
        spec("map", const { &[Param::required("array"), Param::required("template")] }, map),
        spec("filter", const { &[Param::required("array"), Param::required("condition_string")] }, filter_items),
        spec("sum", const { &[Param::required("array"), Param::optional("item_path")] }, sum),
        spec("join", const { &[Param::required("array"), Param::optional("separator")] }, join),
        spec("group_by", const { &[Param::required("array"), Param::required("key_path")] }, group_by),
        spec(
            "sort",
            const { &[Param::required("array"), Param::optional("key_path"), Param::optional("direction")] },
            sort,
        ),
        spec("unique", const { &[Param::required("array")] }, unique),
        spec("flatten", const { &[Param::required("array")] }, flatten),
        spec(
            "if",
            const { &[Param::required("condition"), Param::required("true_value"), Param::required("false_value")] },
            if_else,
        ),
        FunctionSpec {
            name: "create_object",
            params: &[],
            accepts_extra_keywords: true,
            handler: create_object,
        },
        spec("datetime_now", const { &[Param::optional("format")] }, datetime_now),
    ];
    specs.extend(files::catalog());
    specs
}

pub(super) fn spec(
    name: &'static str,
    params: &'static [Param],
    handler: super::registry::Handler,
) -> FunctionSpec {
    FunctionSpec {
        name,
        params,
        accepts_extra_keywords: false,
        handler,
    }
}

// ---------------------------------------------------------------------------
// Key paths
// ---------------------------------------------------------------------------

/// Split `item.a.b` into `["a", "b"]`; bare `item` is the element itself.
fn item_path(args: &Args, path: &str) -> Result<Vec<String>, TransformError> {
    if path == "item" {
        return Ok(Vec::new());
    }
    path.strip_prefix("item.")
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.split('.').map(str::to_string).collect())
        .ok_or_else(|| args.fail(format!("key path must be in format 'item.X', got '{path}'")))
}

fn walk<'v>(value: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn walk_required<'v>(args: &Args, item: &'v Value, path: &[String]) -> Result<&'v Value, TransformError> {
    walk(item, path).ok_or_else(|| args.fail(format!("attribute '{}' not found in array item", path.join("."))))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn get_object_property(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let obj = args.take("obj");
    let path = args.take_string("property_path")?;
    // `items[0].name` and `items.0.name` are the same path.
    let segments: Vec<String> = path
        .replace('[', ".")
        .replace(']', "")
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    walk(&obj, &segments)
        .cloned()
        .ok_or_else(|| args.fail(format!("property '{path}' not found")))
}

fn json_parse(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let text = args.take_string("json_string")?;
    serde_json::from_str::<serde_json::Value>(text.trim())
        .map(Value::from)
        .map_err(|e| args.fail(format!("invalid JSON string: {e}")))
}

fn map(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    match args.take("template") {
        Value::String(path) => {
            let path = item_path(args, &path)?;
            Ok(Value::List(
                array.iter().map(|item| walk(item, &path).cloned().unwrap_or_default()).collect(),
            ))
        }
        Value::Object(template) => {
            let mut projected = Vec::with_capacity(array.len());
            for item in &array {
                let mut out = BTreeMap::new();
                for (key, rule) in &template {
                    let value = match rule {
                        Value::String(path) if path == "item" || path.starts_with("item.") => {
                            walk(item, &item_path(args, path)?).cloned().unwrap_or_default()
                        }
                        fixed => fixed.clone(),
                    };
                    out.insert(key.clone(), value);
                }
                projected.push(Value::Object(out));
            }
            Ok(Value::List(projected))
        }
        other => Err(args.fail(format!(
            "template must be an 'item.X' path or an object, got {}",
            other.kind()
        ))),
    }
}

fn filter_items(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    let source = args.take_string("condition_string")?;
    let condition = filter::parse(&source).map_err(|reason| args.fail(reason))?;
    let mut kept = Vec::new();
    for item in array {
        if condition.evaluate(&item).map_err(|reason| args.fail(reason))? {
            kept.push(item);
        }
    }
    Ok(Value::List(kept))
}

fn sum(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    let path = match args.take_optional_string("item_path")? {
        Some(p) => item_path(args, &p)?,
        None => Vec::new(),
    };
    let mut total = 0.0;
    for item in &array {
        total += walk_required(args, item, &path)?
            .as_f64()
            .ok_or_else(|| args.fail(format!("attribute '{}' is not a number", path.join("."))))?;
    }
    Ok(Value::from_f64(total))
}

fn join(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    let separator = args
        .take_optional("separator")
        .map(|s| s.to_display_string())
        .unwrap_or_else(|| ",".to_string());

    let named = array
        .first()
        .and_then(Value::as_object)
        .is_some_and(|first| first.contains_key("name"));
    let parts: Vec<String> = array
        .iter()
        .map(|item| match item.as_object().and_then(|o| o.get("name")) {
            Some(name) if named => name.to_display_string(),
            _ => item.to_display_string(),
        })
        .collect();
    Ok(Value::String(parts.join(&separator)))
}

fn group_by(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    let key_path = args.take_string("key_path")?;
    let path = item_path(args, &key_path)?;
    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in array {
        let key = walk_required(args, &item, &path)?.to_display_string();
        groups.entry(key).or_default().push(item);
    }
    Ok(Value::Object(
        groups.into_iter().map(|(k, members)| (k, Value::List(members))).collect(),
    ))
}

fn sort(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let array = args.take_list("array")?;
    let path = match args.take_optional_string("key_path")? {
        Some(p) => item_path(args, &p)?,
        None => Vec::new(),
    };
    let descending = match args.take_optional_string("direction")?.as_deref() {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => return Err(args.fail(format!("direction must be 'asc' or 'desc', got '{other}'"))),
    };

    let mut keyed = Vec::with_capacity(array.len());
    for item in array {
        let key = walk_required(args, &item, &path)?.clone();
        keyed.push((key, item));
    }
    if let Some((first, _)) = keyed.first() {
        if let Some((bad, _)) = keyed.iter().find(|(k, _)| first.compare(k).is_none()) {
            return Err(args.fail(format!("cannot order {} against {}", first.kind(), bad.kind())));
        }
    }

    keyed.sort_by(|(a, _), (b, _)| {
        let ord = a.compare(b).unwrap_or(Ordering::Equal);
        if descending { ord.reverse() } else { ord }
    });
    Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
}

fn unique(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let mut seen: Vec<Value> = Vec::new();
    for item in args.take_list("array")? {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    Ok(Value::List(seen))
}

fn flatten(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let mut flat = Vec::new();
    for item in args.take_list("array")? {
        match item {
            Value::List(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    Ok(Value::List(flat))
}

fn if_else(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let holds = match args.take("condition") {
        Value::String(s) => !matches!(s.to_lowercase().as_str(), "false" | "" | "0" | "null" | "none"),
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::List(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::File(_) => true,
    };
    Ok(if holds {
        args.take("true_value")
    } else {
        args.take("false_value")
    })
}

fn create_object(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    Ok(Value::Object(args.take_extra()))
}

fn datetime_now(args: &mut Args, _: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let now = Utc::now();
    match args.take_optional_string("format")?.as_deref() {
        None | Some("iso") => Ok(Value::String(now.to_rfc3339())),
        Some("unix") => Ok(Value::from(now.timestamp())),
        Some(other) => Err(args.fail(format!("format must be 'iso' or 'unix', got '{other}'"))),
    }
}
