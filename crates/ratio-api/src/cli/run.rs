//! `ratio run`: execute a definition through the runtime.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tracing::Instrument;
use tracing::field::Empty;

use ratio_core::engine::{InstanceOutcome, NodeStatus};
use ratio_observe::attrs;
use ratio_types::process::{ParentProcess, Process, ProcessStatus};
use ratio_types::storage::AccessToken;
use ratio_types::value::Value;

use crate::state::{AppState, definition_path};

/// Build the argument object from `--args` or `--args-file`.
pub async fn parse_arguments(
    args: Option<&str>,
    args_file: Option<&Path>,
) -> Result<BTreeMap<String, Value>> {
    let document: serde_json::Value = match (args, args_file) {
        (Some(text), _) => serde_json::from_str(text).context("--args is not valid JSON")?,
        (None, Some(path)) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
            if is_yaml {
                serde_yaml_ng::from_str(&text)
                    .with_context(|| format!("{} is not valid YAML", path.display()))?
            } else {
                serde_json::from_str(&text)
                    .with_context(|| format!("{} is not valid JSON", path.display()))?
            }
        }
        (None, None) => return Ok(BTreeMap::new()),
    };

    match Value::from(document) {
        Value::Object(map) => Ok(map),
        other => bail!("arguments must be a JSON object, got {}", other.kind().as_str()),
    }
}

/// Run a definition and print the outcome.
pub async fn run_definition(
    state: &AppState,
    definition: &str,
    arguments: BTreeMap<String, Value>,
    token: Option<String>,
    show_processes: bool,
    json: bool,
) -> Result<()> {
    let path = definition_path(definition);
    let span = tracing::info_span!(
        "ratio.run",
        ratio.definition = %path,
        ratio.instance_id = Empty,
        ratio.process_id = Empty,
        ratio.status = Empty,
    );

    let outcome = state
        .runtime
        .run_path(&path, arguments, token.map(AccessToken::new))
        .instrument(span.clone())
        .await?;

    span.record(attrs::RATIO_INSTANCE_ID, outcome.instance_id.to_string());
    span.record(attrs::RATIO_PROCESS_ID, outcome.process_id.to_string());
    span.record(attrs::RATIO_STATUS, outcome.status.to_string());

    let processes = if show_processes {
        process_tree(state, outcome.process_id)
    } else {
        Vec::new()
    };

    if json {
        print_json(&outcome, show_processes.then_some(processes.as_slice()))?;
    } else {
        print_styled(&path, &outcome, &processes)?;
    }

    if outcome.status != ProcessStatus::Completed {
        bail!(
            "{path} {}: {}",
            outcome.status,
            outcome.error.as_deref().unwrap_or("no reason given")
        );
    }
    Ok(())
}

/// Every process under `root`, depth-first, paired with its depth.
fn process_tree(state: &AppState, root: uuid::Uuid) -> Vec<(usize, Process)> {
    let mut out = Vec::new();
    let mut stack: Vec<(usize, Process)> = state.runtime.process(root).map(|p| (0, p)).into_iter().collect();
    while let Some((depth, process)) = stack.pop() {
        let children = state
            .runtime
            .processes()
            .children(ParentProcess::Process(process.process_id));
        for child in children.into_iter().rev() {
            stack.push((depth + 1, child));
        }
        out.push((depth, process));
    }
    out
}

fn print_json(outcome: &InstanceOutcome, processes: Option<&[(usize, Process)]>) -> Result<()> {
    let nodes: Vec<serde_json::Value> = outcome
        .nodes
        .iter()
        .map(|node| {
            serde_json::json!({
                "execution_id": node.execution_id,
                "status": node.status.as_str(),
                "process_id": node.process_id,
                "error": node.error,
            })
        })
        .collect();

    let mut report = serde_json::json!({
        "instance_id": outcome.instance_id,
        "process_id": outcome.process_id,
        "status": outcome.status,
        "response": outcome.response,
        "error": outcome.error,
        "nodes": nodes,
    });
    if let Some(processes) = processes {
        let records: Vec<&Process> = processes.iter().map(|(_, p)| p).collect();
        report["processes"] = serde_json::to_value(records)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_styled(path: &str, outcome: &InstanceOutcome, processes: &[(usize, Process)]) -> Result<()> {
    println!();
    println!(
        "  {} {}",
        style(path).cyan().bold(),
        styled_status(outcome.status)
    );
    println!();

    if let Some(response) = &outcome.response {
        let rendered = serde_json::to_string_pretty(response)?;
        for line in rendered.lines() {
            println!("  {line}");
        }
        println!();
    }

    for node in outcome.nodes.iter().filter(|n| n.status == NodeStatus::Failed) {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            style(&node.execution_id).bold(),
            node.error.as_deref().unwrap_or("failed")
        );
    }
    if let Some(error) = &outcome.error {
        println!("  {} {}", style("error:").red().bold(), error);
        println!();
    }

    if !processes.is_empty() {
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Step").fg(Color::White),
            Cell::new("Definition").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Process").fg(Color::White),
            Cell::new("Duration").fg(Color::White),
        ]);

        for (depth, process) in processes {
            let step = process.execution_id.as_deref().unwrap_or("(root)");
            let duration = process
                .ended_on
                .map(|end| format!("{}ms", (end - process.started_on).num_milliseconds()))
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                Cell::new(format!("{}{step}", "  ".repeat(*depth))).fg(Color::Cyan),
                Cell::new(&process.definition),
                status_cell(process.status),
                Cell::new(process.process_id.to_string()).fg(Color::DarkGrey),
                Cell::new(duration).fg(Color::DarkGrey),
            ]);
        }
        println!("{table}");
        println!();
    }
    Ok(())
}

fn styled_status(status: ProcessStatus) -> String {
    match status {
        ProcessStatus::Completed => format!("{}", style("● completed").green()),
        ProcessStatus::Running => format!("{}", style("◐ running").cyan()),
        ProcessStatus::Failed => format!("{}", style("✗ failed").red()),
        ProcessStatus::Skipped => format!("{}", style("○ skipped").yellow()),
        ProcessStatus::Terminated => format!("{}", style("◌ terminated").dim()),
    }
}

fn status_cell(status: ProcessStatus) -> Cell {
    let color = match status {
        ProcessStatus::Completed => Color::Green,
        ProcessStatus::Running => Color::Cyan,
        ProcessStatus::Failed => Color::Red,
        ProcessStatus::Skipped => Color::Yellow,
        ProcessStatus::Terminated => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}
