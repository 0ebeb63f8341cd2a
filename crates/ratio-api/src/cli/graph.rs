//! `ratio graph`: print the step dependency table of a composite.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use ratio_core::definition::DefinitionLoader;
use ratio_core::graph::DependencyGraph;

use crate::state::{AppState, definition_path};

pub async fn show_graph(state: &AppState, definition: &str, json: bool) -> Result<()> {
    let path = definition_path(definition);
    let loaded = state.loader.load(&path).await?;
    if !loaded.is_composite() {
        bail!("{path} is a primitive definition and has no steps");
    }
    let graph = DependencyGraph::build(loaded.steps(), &loaded.arguments)?;

    let mut rows = Vec::new();
    for (level, ids) in graph.levels().into_iter().enumerate() {
        for id in ids {
            let step = loaded.steps().iter().find(|s| s.execution_id == id);
            let deps = graph.dependencies(id).cloned().unwrap_or_default();
            rows.push(GraphRow {
                execution_id: id.to_string(),
                target: step.map(|s| s.target_label().to_string()).unwrap_or_default(),
                level,
                depends_on: deps.all.into_iter().collect(),
                status_branches: deps.status_branches.into_iter().collect(),
                parallel: step.is_some_and(|s| s.parallel_execution.is_some()),
                conditional: step.is_some_and(|s| s.conditions.is_some()),
            });
        }
    }

    if json {
        let report: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| {
                serde_json::json!({
                    "execution_id": r.execution_id,
                    "target": r.target,
                    "level": r.level,
                    "depends_on": r.depends_on,
                    "status_branches": r.status_branches,
                    "parallel": r.parallel,
                    "conditional": r.conditional,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Level").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Target").fg(Color::White),
        Cell::new("Depends On").fg(Color::White),
        Cell::new("Flags").fg(Color::White),
    ]);

    for row in &rows {
        let deps = if row.depends_on.is_empty() {
            "-".to_string()
        } else {
            row.depends_on
                .iter()
                .map(|d| {
                    if row.status_branches.contains(d) {
                        format!("{d} (status)")
                    } else {
                        d.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut flags = Vec::new();
        if row.parallel {
            flags.push("parallel");
        }
        if row.conditional {
            flags.push("conditional");
        }
        table.add_row(vec![
            Cell::new(row.level).fg(Color::DarkGrey),
            Cell::new(&row.execution_id).fg(Color::Cyan),
            Cell::new(&row.target),
            Cell::new(deps),
            Cell::new(flags.join(", ")).fg(Color::Yellow),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} step{}, {} level{}",
        style(rows.len()).bold(),
        if rows.len() == 1 { "" } else { "s" },
        style(graph.levels().len()).bold(),
        if graph.levels().len() == 1 { "" } else { "s" },
    );
    println!();
    Ok(())
}

struct GraphRow {
    execution_id: String,
    target: String,
    level: usize,
    depends_on: Vec<String>,
    status_branches: Vec<String>,
    parallel: bool,
    conditional: bool,
}
