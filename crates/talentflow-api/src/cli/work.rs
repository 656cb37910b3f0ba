//! Work item commands: list, complete, approve, reject.

use anyhow::Result;
use comfy_table::Cell;
use console::style;
use serde_json::json;
use talentflow_core::repository::InstanceStore;
use talentflow_core::workflow::gateway::Resolution;
use talentflow_types::instance::{ApprovalDecision, WorkKind};

use super::output::{
    format_time, parse_id, parse_json_arg, preview, print_json, short_id, table, work_status_cell,
};
use crate::state::AppState;

pub async fn list_work(state: &AppState, instance_id: &str, json: bool) -> Result<()> {
    let id = parse_id("instance", instance_id)?;
    // Surface a clear error for unknown instances rather than an empty list.
    state.engine.get_instance(id).await?;
    let items = state.engine.store().list_work(&id).await?;

    if json {
        return print_json(&items);
    }

    if items.is_empty() {
        println!();
        println!("  No work items for instance {}.", style(short_id(&id)).cyan());
        println!();
        return Ok(());
    }

    let mut table = table(&["Work ID", "Step", "Kind", "Assignee", "Status", "Expires", "Resolution"]);
    for w in &items {
        let kind = match w.kind {
            WorkKind::Task => "task",
            WorkKind::Approval => "approval",
        };
        table.add_row(vec![
            Cell::new(w.id),
            Cell::new(&w.step_id),
            Cell::new(kind),
            Cell::new(&w.assignee),
            work_status_cell(w.status),
            Cell::new(w.expires_at.as_ref().map(format_time).unwrap_or_else(|| "-".into())),
            Cell::new(w.resolution.as_ref().map(|r| preview(r, 40)).unwrap_or_default()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn complete(state: &AppState, work_id: &str, result: Option<&str>, json: bool) -> Result<()> {
    let id = parse_id("work", work_id)?;
    let result = parse_json_arg("result", result)?;
    let resolution = state.gateway.complete_task(id, result).await?;
    report(&resolution, "completed", json)
}

pub async fn decide(
    state: &AppState,
    work_id: &str,
    decision: ApprovalDecision,
    comments: Option<String>,
    json: bool,
) -> Result<()> {
    let id = parse_id("work", work_id)?;
    let resolution = state.gateway.decide_approval(id, decision, comments).await?;
    let verb = match decision {
        ApprovalDecision::Approve => "approved",
        ApprovalDecision::Reject => "rejected",
    };
    report(&resolution, verb, json)
}

fn report(resolution: &Resolution, verb: &str, json: bool) -> Result<()> {
    let work = &resolution.work;
    if json {
        return print_json(&json!({
            "work_id": work.id,
            "instance_id": work.instance_id,
            "step_id": work.step_id,
            "status": work.status,
            "already_resolved": resolution.already_resolved,
            "instance_status": resolution.instance_status,
        }));
    }

    println!();
    if resolution.already_resolved {
        println!(
            "  {} Work {} was already {}; nothing changed.",
            style("!").yellow().bold(),
            style(short_id(&work.id)).cyan(),
            work.status
        );
    } else {
        println!(
            "  {} '{}' {verb}",
            style("*").green().bold(),
            style(&work.step_id).cyan()
        );
    }
    match resolution.instance_status {
        Some(status) => println!("  Instance {}: {status}", short_id(&work.instance_id)),
        None => println!("  Instance {} no longer exists", short_id(&work.instance_id)),
    }
    println!();
    Ok(())
}
