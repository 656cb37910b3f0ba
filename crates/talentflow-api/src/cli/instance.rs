//! Instance commands: start, event, show, cancel, failed.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use comfy_table::{Cell, Color};
use console::style;
use serde_json::json;
use talentflow_types::instance::{ExecutionStatus, StepExecution, Suspension, WorkflowInstance};
use uuid::Uuid;

use super::output::{
    format_time, parse_id, parse_json_arg, parse_time, preview, print_json, short_id, status_cell,
    table,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Start / event
// ---------------------------------------------------------------------------

pub async fn start(state: &AppState, template: &str, context: Option<&str>, json: bool) -> Result<()> {
    let context = parse_json_arg("context", context)?;
    let id = state
        .triggers
        .start_manual(template, context)
        .await
        .with_context(|| format!("failed to start '{template}'"))?;
    let instance = state.engine.get_instance(id).await?;

    if json {
        return print_json(&json!({
            "instance_id": id,
            "workflow": instance.definition_name,
            "status": instance.status,
        }));
    }
    println!();
    println!(
        "  {} Started '{}'",
        style("*").green().bold(),
        style(template).cyan()
    );
    println!("  Instance: {id}");
    println!("  Status:   {}", instance.status);
    print_pending_hint(&instance);
    println!();
    Ok(())
}

pub async fn event(state: &AppState, name: &str, payload: Option<&str>, json: bool) -> Result<()> {
    let payload = parse_json_arg("payload", payload)?;
    let started = state
        .triggers
        .fire_event(name, payload)
        .await
        .with_context(|| format!("failed to publish event '{name}'"))?;

    if json {
        return print_json(&json!({ "event": name, "started": started }));
    }
    println!();
    if started.is_empty() {
        println!("  No workflow subscribed to '{}' matched.", style(name).cyan());
    } else {
        println!(
            "  {} '{}' started {} instance(s)",
            style("*").green().bold(),
            style(name).cyan(),
            started.len()
        );
        for id in &started {
            let instance = state.engine.get_instance(*id).await?;
            println!("  {id}  {}  {}", instance.definition_name, instance.status);
        }
    }
    println!();
    Ok(())
}

fn print_pending_hint(instance: &WorkflowInstance) {
    let waiting: Vec<&StepExecution> = instance
        .running_steps
        .iter()
        .filter(|e| e.status == ExecutionStatus::Suspended)
        .collect();
    if waiting.is_empty() {
        return;
    }
    println!("  Waiting on:");
    for exec in waiting {
        println!("    {} ({})", style(&exec.step_id).cyan(), describe_suspension(exec));
    }
}

fn describe_suspension(exec: &StepExecution) -> String {
    match &exec.suspension {
        Some(Suspension::Work { work_id, expires_at }) => match expires_at {
            Some(at) => format!("{} {work_id}, expires {}", exec.kind, format_time(at)),
            None => format!("{} {work_id}", exec.kind),
        },
        Some(Suspension::Timer { wake_at }) => format!("timer until {}", format_time(wake_at)),
        None => exec.kind.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show(state: &AppState, instance_id: &str, json: bool) -> Result<()> {
    let id = parse_id("instance", instance_id)?;
    let instance = state.engine.get_instance(id).await?;

    if json {
        return print_json(&instance);
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Instance").bold(),
        style(short_id(&instance.id)).cyan(),
        instance.definition_name
    );
    println!("  ID:      {}", instance.id);
    println!("  Status:  {}", instance.status);
    println!("  Started: {}", format_time(&instance.created_at));
    if let Some(ended) = instance.ended_at {
        println!("  Ended:   {}", format_time(&ended));
    }
    if let Some(t) = &instance.termination {
        let step = t.step_id.as_deref().map(|s| format!(" at '{s}'")).unwrap_or_default();
        println!("  Reason:  {}{step}: {}", style(t.kind).red(), t.message);
    }
    println!();

    let mut steps = table(&["Step", "Kind", "Status", "Attempt", "Started", "Detail"]);
    let mut log: Vec<&StepExecution> = instance
        .completed_steps
        .iter()
        .chain(instance.failed_steps.iter())
        .chain(instance.running_steps.iter())
        .collect();
    log.sort_by_key(|e| e.started_at);
    for exec in log {
        let (status, color) = match exec.status {
            ExecutionStatus::Completed => ("completed", Color::Green),
            ExecutionStatus::Failed => ("failed", Color::Red),
            ExecutionStatus::Suspended => ("suspended", Color::Yellow),
            ExecutionStatus::Running => ("running", Color::Cyan),
        };
        let detail = match exec.status {
            ExecutionStatus::Failed => exec.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            ExecutionStatus::Suspended => describe_suspension(exec),
            _ => exec.result.as_ref().map(|r| preview(r, 48)).unwrap_or_default(),
        };
        steps.add_row(vec![
            Cell::new(&exec.step_id),
            Cell::new(exec.kind),
            Cell::new(status).fg(color),
            Cell::new(exec.attempt),
            Cell::new(format_time(&exec.started_at)),
            Cell::new(detail),
        ]);
    }
    println!("{steps}");

    let open_joins: Vec<_> = instance
        .pending_joins
        .iter()
        .filter(|(_, j)| j.is_partial())
        .collect();
    if !open_joins.is_empty() {
        println!();
        println!("  {}", style("── Joins ──").dim());
        for (merge, join) in open_joins {
            println!(
                "  {merge}: {}/{} arrived ({})",
                join.arrived.len(),
                join.expected,
                join.arrived.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }

    if !instance.variables.is_empty() {
        println!();
        println!("  {}", style("── Variables ──").dim());
        for (key, value) in &instance.variables {
            println!("  {key} = {}", preview(value, 72));
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn cancel(state: &AppState, instance_id: &str, reason: &str, json: bool) -> Result<()> {
    let id = parse_id("instance", instance_id)?;
    let status = state.engine.cancel_instance(id, reason).await?;

    if json {
        return print_json(&json!({ "instance_id": id, "status": status }));
    }
    println!();
    println!("  Instance {} is {}", style(short_id(&id)).cyan(), status);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Failed
// ---------------------------------------------------------------------------

/// Resolve `--definition` as a template name first, then as a UUID.
async fn resolve_definition(state: &AppState, raw: &str) -> Result<Uuid> {
    if let Some(id) = state.triggers.definition_id(raw).await {
        return Ok(id);
    }
    parse_id("definition", raw)
}

pub async fn failed(
    state: &AppState,
    definition: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    json: bool,
) -> Result<()> {
    let definition_id = match definition {
        Some(raw) => Some(resolve_definition(state, raw).await?),
        None => None,
    };
    let to = until.map(parse_time).transpose()?.unwrap_or_else(Utc::now);
    let from = since
        .map(parse_time)
        .transpose()?
        .unwrap_or_else(|| to - Duration::days(7));

    let failed = state.engine.list_failed(definition_id, from, to).await?;

    if json {
        let out: Vec<_> = failed
            .iter()
            .map(|i| {
                json!({
                    "instance_id": i.id,
                    "workflow": i.definition_name,
                    "ended_at": i.ended_at,
                    "termination": i.termination,
                })
            })
            .collect();
        return print_json(&out);
    }

    if failed.is_empty() {
        println!();
        println!(
            "  No failed instances between {} and {}.",
            format_time(&from),
            format_time(&to)
        );
        println!();
        return Ok(());
    }

    let mut table = table(&["Instance", "Workflow", "Status", "Ended", "Step", "Reason"]);
    for i in &failed {
        let (step, reason) = i
            .termination
            .as_ref()
            .map(|t| (t.step_id.clone().unwrap_or_default(), format!("{}: {}", t.kind, t.message)))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(short_id(&i.id)),
            Cell::new(&i.definition_name),
            status_cell(i.status),
            Cell::new(i.ended_at.as_ref().map(format_time).unwrap_or_default()),
            Cell::new(step),
            Cell::new(reason),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}
