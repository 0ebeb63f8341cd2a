//! `ratio validate`: static checks without execution.

use anyhow::Result;
use console::style;

use ratio_core::definition::DefinitionLoader;
use ratio_types::definition::Definition;

use crate::state::{AppState, definition_path};

/// Load a definition and every definition its steps reference by path.
///
/// Loading runs the full static validation; inline definitions are checked
/// as part of their parent document.
pub async fn validate_definition(state: &AppState, definition: &str, json: bool) -> Result<()> {
    let path = definition_path(definition);
    let mut checked = Vec::new();
    let mut failures = Vec::new();
    let mut queue = vec![path.clone()];

    while let Some(next) = queue.pop() {
        if checked.contains(&next) {
            continue;
        }
        checked.push(next.clone());
        match state.loader.load(&next).await {
            Ok(loaded) => queue.extend(referenced_paths(&loaded)),
            Err(err) => failures.push((next.clone(), err.to_string())),
        }
    }

    if json {
        let report = serde_json::json!({
            "definition": path,
            "valid": failures.is_empty(),
            "checked": checked,
            "errors": failures
                .iter()
                .map(|(p, e)| serde_json::json!({"definition": p, "error": e}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        for checked_path in &checked {
            match failures.iter().find(|(p, _)| p == checked_path) {
                Some((_, err)) => println!("  {} {checked_path}: {err}", style("✗").red()),
                None => println!("  {} {checked_path}", style("✓").green()),
            }
        }
        println!();
    }

    if !failures.is_empty() {
        anyhow::bail!("{} of {} definitions invalid", failures.len(), checked.len());
    }
    Ok(())
}

/// Definition paths referenced by steps, including those of inline children.
fn referenced_paths(definition: &Definition) -> Vec<String> {
    let mut out = Vec::new();
    for step in definition.steps() {
        if let Some(path) = &step.definition_path {
            out.push(path.clone());
        }
        if let Some(inline) = &step.inline_definition {
            out.extend(referenced_paths(inline));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_nested_paths() {
        let definition: Definition = serde_json::from_value(json!({
            "instructions": [
                {"execution_id": "a", "definition_path": "/tools/echo.json"},
                {"execution_id": "b", "inline_definition": {
                    "instructions": [{"execution_id": "c", "definition_path": "/tools/fail.json"}]
                }}
            ]
        }))
        .unwrap();
        assert_eq!(referenced_paths(&definition), vec!["/tools/echo.json", "/tools/fail.json"]);
    }
}
