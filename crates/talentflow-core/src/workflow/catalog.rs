//! Read-only catalog of workflow templates.
//!
//! Built once at startup from the built-in templates plus an optional
//! directory of YAML files, then shared behind an `Arc`. There is no
//! mutation API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::definition::{WorkflowError, discover_workflows, parse_workflow_yaml};
use super::graph::ValidatedDefinition;

const BUILTIN_TEMPLATES: [(&str, &str); 3] = [
    (
        "employee-onboarding",
        include_str!("../../templates/employee-onboarding.yaml"),
    ),
    (
        "leave-approval",
        include_str!("../../templates/leave-approval.yaml"),
    ),
    ("payroll-run", include_str!("../../templates/payroll-run.yaml")),
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("template '{name}' is invalid: {source}")]
    InvalidTemplate {
        name: String,
        #[source]
        source: WorkflowError,
    },

    #[error("template '{name}' is defined twice ({path})")]
    Duplicate { name: String, path: PathBuf },

    #[error(transparent)]
    Discovery(#[from] WorkflowError),
}

#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Arc<ValidatedDefinition>>,
}

impl TemplateCatalog {
    /// Catalog holding only the built-in templates.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mut templates = BTreeMap::new();
        for (name, yaml) in BUILTIN_TEMPLATES {
            let def = parse_workflow_yaml(yaml)
                .and_then(ValidatedDefinition::new)
                .map_err(|source| CatalogError::InvalidTemplate {
                    name: name.to_string(),
                    source,
                })?;
            templates.insert(def.name().to_string(), Arc::new(def));
        }
        Ok(Self { templates })
    }

    /// Built-in templates plus every valid YAML file under `templates_dir`.
    ///
    /// A file may not reuse the name of a built-in or of another file.
    /// Unparseable files are skipped with a warning.
    pub fn load(templates_dir: Option<&Path>) -> Result<Self, CatalogError> {
        let mut catalog = Self::builtin()?;
        let Some(dir) = templates_dir else {
            return Ok(catalog);
        };
        for (path, def) in discover_workflows(dir)? {
            if catalog.templates.contains_key(&def.name) {
                return Err(CatalogError::Duplicate {
                    name: def.name,
                    path,
                });
            }
            let name = def.name.clone();
            let def = ValidatedDefinition::new(def)
                .map_err(|source| CatalogError::InvalidTemplate { name: name.clone(), source })?;
            tracing::debug!(template = %name, ?path, "loaded workflow template");
            catalog.templates.insert(name, Arc::new(def));
        }
        tracing::info!(templates = catalog.templates.len(), dir = ?dir, "template catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ValidatedDefinition>> {
        self.templates.get(name)
    }

    /// Templates sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ValidatedDefinition>> {
        self.templates.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talentflow_types::workflow::{StepKind, TriggerSpec};

    #[test]
    fn builtin_templates_validate() {
        let catalog = TemplateCatalog::builtin().unwrap();
        assert_eq!(
            catalog.names().collect::<Vec<_>>(),
            ["employee-onboarding", "leave-approval", "payroll-run"]
        );

        let onboarding = catalog.get("employee-onboarding").unwrap();
        assert_eq!(onboarding.graph().fan_in("ready"), 3);
        assert!(matches!(
            onboarding.definition().triggers[0],
            TriggerSpec::Event { ref event, .. } if event == "candidate.hired"
        ));

        let payroll = catalog.get("payroll-run").unwrap();
        assert!(payroll
            .definition()
            .triggers
            .iter()
            .any(|t| matches!(t, TriggerSpec::Cron { .. })));
        assert_eq!(payroll.step("total").unwrap().kind(), StepKind::DataTransform);
    }

    #[test]
    fn builtin_ids_are_stable() {
        let a = TemplateCatalog::builtin().unwrap();
        let b = TemplateCatalog::builtin().unwrap();
        for def in a.iter() {
            assert_eq!(b.get(def.name()).unwrap().id(), def.id());
        }
    }

    #[test]
    fn load_adds_directory_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("exit.yaml"),
            r#"
name: employee-exit
steps:
  - id: start
    config: { kind: start }
    next: [revoke]
  - id: revoke
    config: { kind: task, assignee: it@example.com }
    next: [end]
  - id: end
    config: { kind: end }
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: [").unwrap();

        let catalog = TemplateCatalog::load(Some(dir.path())).unwrap();
        assert_eq!(catalog.len(), 4);
        assert!(catalog.get("employee-exit").is_some());
    }

    #[test]
    fn load_rejects_shadowing_a_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = BUILTIN_TEMPLATES[1].1;
        std::fs::write(dir.path().join("copy.yml"), yaml).unwrap();

        let err = TemplateCatalog::load(Some(dir.path())).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate { .. }), "got: {err}");
    }

    #[test]
    fn missing_directory_yields_builtins() {
        let catalog = TemplateCatalog::load(Some(Path::new("/nonexistent/talentflow"))).unwrap();
        assert_eq!(catalog.len(), 3);
    }
}
