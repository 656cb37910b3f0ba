//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, enforces the graph
//! invariants a definition must satisfy before it can be activated, and
//! discovers template files on disk.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use talentflow_types::workflow::{StepConfig, StepKind, WorkflowDefinition};
use thiserror::Error;

use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The definition violates a structural rule and may not be activated.
    #[error("invalid definition ({rule}): {detail}")]
    InvalidDefinition { rule: ValidationRule, detail: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    fn invalid(rule: ValidationRule, detail: impl Into<String>) -> Self {
        WorkflowError::InvalidDefinition {
            rule,
            detail: detail.into(),
        }
    }

    /// The violated rule, for `InvalidDefinition` errors.
    pub fn rule(&self) -> Option<ValidationRule> {
        match self {
            WorkflowError::InvalidDefinition { rule, .. } => Some(*rule),
            _ => None,
        }
    }
}

/// Structural rules, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationRule {
    /// Name is non-empty and limited to alphanumerics, hyphens, underscores.
    Name,
    /// Version is a semantic version.
    Version,
    /// Step ids are unique.
    UniqueStepIds,
    /// (a) exactly one `start` step.
    SingleStart,
    /// (b) at least one `end` step.
    HasEnd,
    /// (c) every edge target exists among `steps`.
    KnownTargets,
    /// (d) every non-`end` step has at least one successor.
    NonEndHasSuccessor,
    /// (e) every `merge` step has at least two distinct predecessors.
    MergeFanIn,
    /// Kind-specific config constraints.
    StepConfig,
    /// An `end` step is reachable from `start`.
    EndReachable,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::Name => "name",
            ValidationRule::Version => "version",
            ValidationRule::UniqueStepIds => "unique-step-ids",
            ValidationRule::SingleStart => "single-start",
            ValidationRule::HasEnd => "has-end",
            ValidationRule::KnownTargets => "known-targets",
            ValidationRule::NonEndHasSuccessor => "non-end-has-successor",
            ValidationRule::MergeFanIn => "merge-fan-in",
            ValidationRule::StepConfig => "step-config",
            ValidationRule::EndReachable => "end-reachable",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition. The first violated rule is reported.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty()
        || !def
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::invalid(
            ValidationRule::Name,
            format!(
                "workflow name '{}' must be non-empty and use only alphanumerics, '-' or '_'",
                def.name
            ),
        ));
    }

    if semver::Version::parse(&def.version).is_err() {
        return Err(WorkflowError::invalid(
            ValidationRule::Version,
            format!("'{}' is not a semantic version", def.version),
        ));
    }

    let mut ids = HashSet::new();
    for step in &def.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(WorkflowError::invalid(
                ValidationRule::UniqueStepIds,
                format!("duplicate step id '{}'", step.id),
            ));
        }
    }

    // (a)
    let starts = def.steps.iter().filter(|s| s.kind() == StepKind::Start).count();
    if starts != 1 {
        return Err(WorkflowError::invalid(
            ValidationRule::SingleStart,
            format!("expected exactly one start step, found {starts}"),
        ));
    }

    // (b)
    if !def.steps.iter().any(|s| s.kind() == StepKind::End) {
        return Err(WorkflowError::invalid(
            ValidationRule::HasEnd,
            "workflow has no end step",
        ));
    }

    // (c)
    for step in &def.steps {
        for target in step.edges() {
            if !ids.contains(target.as_str()) {
                return Err(WorkflowError::invalid(
                    ValidationRule::KnownTargets,
                    format!("step '{}' points to unknown step '{}'", step.id, target),
                ));
            }
        }
    }

    // (d)
    for step in &def.steps {
        if step.kind() != StepKind::End && step.edges().is_empty() {
            return Err(WorkflowError::invalid(
                ValidationRule::NonEndHasSuccessor,
                format!("step '{}' has no successor", step.id),
            ));
        }
    }

    let graph = WorkflowGraph::from_definition(def);

    // (e)
    for step in def.steps.iter().filter(|s| s.kind() == StepKind::Merge) {
        let fan_in = graph.fan_in(&step.id);
        if fan_in < 2 {
            return Err(WorkflowError::invalid(
                ValidationRule::MergeFanIn,
                format!(
                    "merge step '{}' has {fan_in} distinct predecessor(s), needs at least 2",
                    step.id
                ),
            ));
        }
    }

    for step in &def.steps {
        validate_step_config(&step.id, &step.config)?;
    }

    let start = def
        .start_step()
        .map(|s| s.id.as_str())
        .unwrap_or_default();
    let reachable = def
        .steps
        .iter()
        .filter(|s| s.kind() == StepKind::End)
        .any(|end| graph.has_path(start, &end.id));
    if !reachable {
        return Err(WorkflowError::invalid(
            ValidationRule::EndReachable,
            format!("no end step is reachable from '{start}'"),
        ));
    }

    Ok(())
}

fn validate_step_config(step_id: &str, config: &StepConfig) -> Result<(), WorkflowError> {
    let fail = |detail: String| Err(WorkflowError::invalid(ValidationRule::StepConfig, detail));

    match config {
        StepConfig::Decision { rules, default } => {
            if rules.is_empty() && default.is_none() {
                return fail(format!("decision '{step_id}' has no rules and no default"));
            }
            if let Some(rule) = rules.iter().find(|r| r.when.trim().is_empty()) {
                return fail(format!(
                    "decision '{step_id}' has an empty predicate for branch '{}'",
                    rule.next
                ));
            }
        }
        StepConfig::Parallel { branches } if branches.is_empty() => {
            return fail(format!("parallel '{step_id}' has no branches"));
        }
        StepConfig::Delay {
            duration_secs,
            until,
        } => {
            if duration_secs.is_some() == until.is_some() {
                return fail(format!(
                    "delay '{step_id}' needs exactly one of duration_secs or until"
                ));
            }
        }
        StepConfig::Approval {
            expires_in_secs: Some(_),
            expires_at: Some(_),
            ..
        } => {
            return fail(format!(
                "approval '{step_id}' sets both expires_in_secs and expires_at"
            ));
        }
        StepConfig::Task { assignee, .. } | StepConfig::Approval { approver: assignee, .. }
            if assignee.trim().is_empty() =>
        {
            return fail(format!("step '{step_id}' has no assignee"));
        }
        StepConfig::ApiCall { method, retry, .. } => {
            let known = ["GET", "POST", "PUT", "PATCH", "DELETE"];
            if !known.contains(&method.to_ascii_uppercase().as_str()) {
                return fail(format!("api_call '{step_id}' uses unsupported method '{method}'"));
            }
            if retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
                return fail(format!("api_call '{step_id}' retry.max_attempts must be >= 1"));
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all valid workflow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(err) => {
                tracing::warn!(?path, error = %err, "skipping invalid workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use talentflow_types::workflow::{DecisionRule, Step};
    use uuid::Uuid;

    fn step(id: &str, config: StepConfig, next: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            config,
            next: next.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn task(id: &str, next: &[&str]) -> Step {
        step(
            id,
            StepConfig::Task {
                assignee: "it-desk".to_string(),
                title: None,
                payload: serde_json::Value::Null,
                due_in_secs: None,
                escalation: None,
                output_key: None,
            },
            next,
        )
    }

    fn workflow(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "onboarding".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            triggers: vec![],
            variables: serde_json::Map::new(),
            steps,
            metadata: HashMap::new(),
        }
    }

    fn linear() -> WorkflowDefinition {
        workflow(vec![
            step("start", StepConfig::Start, &["task-a"]),
            task("task-a", &["end"]),
            step("end", StepConfig::End, &[]),
        ])
    }

    fn rule_of(def: &WorkflowDefinition) -> ValidationRule {
        validate_definition(def)
            .expect_err("definition should be rejected")
            .rule()
            .expect("should be an InvalidDefinition error")
    }

    // -----------------------------------------------------------------------
    // Graph rules
    // -----------------------------------------------------------------------

    #[test]
    fn test_linear_workflow_is_valid() {
        assert!(validate_definition(&linear()).is_ok());
    }

    #[test]
    fn test_rejects_missing_start() {
        let def = workflow(vec![task("a", &["end"]), step("end", StepConfig::End, &[])]);
        assert_eq!(rule_of(&def), ValidationRule::SingleStart);
    }

    #[test]
    fn test_rejects_two_starts() {
        let mut def = linear();
        def.steps.push(step("start-2", StepConfig::Start, &["end"]));
        assert_eq!(rule_of(&def), ValidationRule::SingleStart);
    }

    #[test]
    fn test_rejects_missing_end() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["a"]),
            task("a", &["start"]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::HasEnd);
    }

    #[test]
    fn test_rejects_unknown_next() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["ghost"]),
            step("end", StepConfig::End, &[]),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::KnownTargets));
        assert!(err.to_string().contains("ghost"), "got: {err}");
    }

    #[test]
    fn test_rejects_unknown_decision_target() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["route"]),
            step(
                "route",
                StepConfig::Decision {
                    rules: vec![DecisionRule { when: "true".into(), next: "end".into() }],
                    default: Some("missing".into()),
                },
                &[],
            ),
            step("end", StepConfig::End, &[]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::KnownTargets);
    }

    #[test]
    fn test_rejects_dead_end_step() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["a", "end"]),
            task("a", &[]),
            step("end", StepConfig::End, &[]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::NonEndHasSuccessor);
    }

    #[test]
    fn test_rejects_merge_with_single_predecessor() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["a"]),
            task("a", &["join"]),
            step("join", StepConfig::Merge, &["end"]),
            step("end", StepConfig::End, &[]),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::MergeFanIn));
        assert!(err.to_string().contains("join"), "got: {err}");
    }

    #[test]
    fn test_accepts_parallel_merge() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["fork"]),
            step("fork", StepConfig::Parallel { branches: vec!["a".into(), "b".into()] }, &[]),
            task("a", &["join"]),
            task("b", &["join"]),
            step("join", StepConfig::Merge, &["end"]),
            step("end", StepConfig::End, &[]),
        ]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_rules_checked_in_order() {
        // Missing start and missing end: rule (a) is reported first.
        let def = workflow(vec![task("a", &["b"]), task("b", &["a"])]);
        assert_eq!(rule_of(&def), ValidationRule::SingleStart);
    }

    #[test]
    fn test_rejects_unreachable_end() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["a"]),
            task("a", &["b"]),
            task("b", &["a"]),
            step("end", StepConfig::End, &[]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::EndReachable);
    }

    // -----------------------------------------------------------------------
    // Naming, ids, and step configs
    // -----------------------------------------------------------------------

    #[test]
    fn test_rejects_duplicate_step_ids() {
        let mut def = linear();
        def.steps.push(task("task-a", &["end"]));
        assert_eq!(rule_of(&def), ValidationRule::UniqueStepIds);
    }

    #[test]
    fn test_rejects_invalid_name() {
        let mut def = linear();
        def.name = "has spaces".to_string();
        assert_eq!(rule_of(&def), ValidationRule::Name);
        def.name = String::new();
        assert_eq!(rule_of(&def), ValidationRule::Name);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut def = linear();
        def.version = "v1".to_string();
        assert_eq!(rule_of(&def), ValidationRule::Version);
    }

    #[test]
    fn test_rejects_delay_with_both_duration_and_until() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["wait"]),
            step(
                "wait",
                StepConfig::Delay {
                    duration_secs: Some(60),
                    until: Some("{{start_date}}".into()),
                },
                &["end"],
            ),
            step("end", StepConfig::End, &[]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::StepConfig);
    }

    #[test]
    fn test_rejects_unknown_http_method() {
        let def = workflow(vec![
            step("start", StepConfig::Start, &["call"]),
            step(
                "call",
                StepConfig::ApiCall {
                    service: "ats".into(),
                    method: "BREW".into(),
                    path: "/".into(),
                    headers: Default::default(),
                    body: None,
                    output_key: None,
                    retry: None,
                },
                &["end"],
            ),
            step("end", StepConfig::End, &[]),
        ]);
        assert_eq!(rule_of(&def), ValidationRule::StepConfig);
    }

    // -----------------------------------------------------------------------
    // YAML
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = serialize_workflow_yaml(&linear()).unwrap();
        let parsed = parse_workflow_yaml(&yaml).expect("should parse");
        assert_eq!(parsed.name, "onboarding");
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.steps[1].kind(), StepKind::Task);
    }

    #[test]
    fn test_parse_yaml_rejects_invalid_graph() {
        let yaml = r#"
name: broken
steps:
  - id: start
    config: { kind: start }
    next: [nowhere]
  - id: end
    config: { kind: end }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::KnownTargets));
    }

    #[test]
    fn test_parse_yaml_reports_unknown_kind() {
        let yaml = r#"
name: broken
steps:
  - id: start
    config: { kind: teleport }
"#;
        assert!(matches!(
            parse_workflow_yaml(yaml),
            Err(WorkflowError::ParseError(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates/onboarding.yaml");

        save_workflow_file(&path, &linear()).expect("should save");
        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded.name, "onboarding");
        assert_eq!(loaded.steps.len(), 3);
    }

    #[test]
    fn test_discover_workflows_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut second = linear();
        second.name = "offboarding".to_string();

        save_workflow_file(&dir.path().join("a.yaml"), &linear()).unwrap();
        save_workflow_file(&dir.path().join("nested/b.yml"), &second).unwrap();
        std::fs::write(dir.path().join("notes.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        let names: Vec<&str> = found.iter().map(|(_, d)| d.name.as_str()).collect();
        assert_eq!(names, vec!["onboarding", "offboarding"]);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path"));
        assert!(result.unwrap().is_empty());
    }
}
