//! `tflow templates` and `tflow validate`.

use std::path::Path;

use anyhow::Result;
use comfy_table::Cell;
use console::style;
use serde_json::json;
use talentflow_core::workflow::catalog::TemplateCatalog;
use talentflow_core::workflow::definition::{WorkflowError, load_workflow_file};
use talentflow_core::workflow::graph::ValidatedDefinition;
use talentflow_types::workflow::TriggerSpec;

use super::output::{print_json, table};

fn describe_trigger(trigger: &TriggerSpec) -> String {
    match trigger {
        TriggerSpec::Manual {} => "manual".to_string(),
        TriggerSpec::Event { event, when: None } => format!("event:{event}"),
        TriggerSpec::Event {
            event,
            when: Some(_),
        } => format!("event:{event} (filtered)"),
        TriggerSpec::Cron { schedule, .. } => format!("cron:{schedule}"),
    }
}

/// List the catalog.
pub fn list_templates(catalog: &TemplateCatalog, json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = catalog
            .iter()
            .map(|t| {
                let def = t.definition();
                json!({
                    "id": def.id,
                    "name": def.name,
                    "version": def.version,
                    "description": def.description,
                    "steps": def.steps.len(),
                    "triggers": def.triggers.iter().map(describe_trigger).collect::<Vec<_>>(),
                })
            })
            .collect();
        return print_json(&out);
    }

    let mut table = table(&["Name", "Version", "Steps", "Triggers", "Description"]);
    for t in catalog.iter() {
        let def = t.definition();
        let triggers: Vec<String> = def.triggers.iter().map(describe_trigger).collect();
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(&def.version),
            Cell::new(def.steps.len()),
            Cell::new(triggers.join("\n")),
            Cell::new(def.description.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Parse and validate a definition file. Returns whether it is valid.
pub fn validate_file(path: &Path, json: bool) -> Result<bool> {
    let checked = load_workflow_file(path).and_then(ValidatedDefinition::new);

    match checked {
        Ok(def) => {
            let merges: Vec<_> = def
                .merges()
                .map(|(id, fan_in)| json!({ "step": id, "fan_in": fan_in }))
                .collect();
            if json {
                print_json(&json!({
                    "valid": true,
                    "name": def.name(),
                    "version": def.definition().version,
                    "steps": def.definition().steps.len(),
                    "merges": merges,
                }))?;
            } else {
                println!();
                println!(
                    "  {} '{}' is valid",
                    style("✓").green().bold(),
                    style(def.name()).cyan()
                );
                println!("  Steps: {}", def.definition().steps.len());
                for (id, fan_in) in def.merges() {
                    println!("  Merge {}: waits for {fan_in} branches", style(id).cyan());
                }
                println!();
            }
            Ok(true)
        }
        Err(err) => {
            let rule = err.rule().map(|r| r.as_str());
            if json {
                print_json(&json!({
                    "valid": false,
                    "rule": rule,
                    "error": err.to_string(),
                }))?;
            } else {
                println!();
                println!("  {} {}", style("✗").red().bold(), path.display());
                match &err {
                    WorkflowError::InvalidDefinition { rule, detail } => {
                        println!("  Rule:   {}", style(rule).yellow());
                        println!("  Detail: {detail}");
                    }
                    other => println!("  {other}"),
                }
                println!();
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_triggers() {
        assert_eq!(describe_trigger(&TriggerSpec::Manual {}), "manual");
        assert_eq!(
            describe_trigger(&TriggerSpec::Event {
                event: "leave.requested".into(),
                when: Some("event.days > 0".into()),
            }),
            "event:leave.requested (filtered)"
        );
        assert_eq!(
            describe_trigger(&TriggerSpec::Cron {
                schedule: "0 6 25 * *".into(),
                timezone: None,
            }),
            "cron:0 6 25 * *"
        );
    }

    #[test]
    fn validate_reports_rule() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        std::fs::write(
            &good,
            "name: exit\nsteps:\n  - id: start\n    config: { kind: start }\n    next: [end]\n  - id: end\n    config: { kind: end }\n",
        )
        .unwrap();
        assert!(validate_file(&good, true).unwrap());

        let bad = dir.path().join("bad.yaml");
        std::fs::write(
            &bad,
            "name: exit\nsteps:\n  - id: start\n    config: { kind: start }\n    next: [nowhere]\n  - id: end\n    config: { kind: end }\n",
        )
        .unwrap();
        assert!(!validate_file(&bad, true).unwrap());
        assert!(!validate_file(&dir.path().join("missing.yaml"), false).unwrap());
    }
}
