//! CLI command definitions for the `tflow` binary.
//!
//! Uses clap derive macros. Commands are grouped by what they act on:
//! templates, instances, work items, and the runtime loop.

pub mod instance;
pub mod output;
pub mod runtime;
pub mod template;
pub mod work;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run HR workflows: onboarding, leave approvals, payroll.
#[derive(Parser)]
#[command(name = "tflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        let serving = matches!(self.command, Commands::Serve { .. });
        match self.verbose {
            0 if self.quiet => "error",
            0 if serving => "info",
            0 => "warn",
            1 => "info,talentflow_core=debug,talentflow_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the workflow templates in the catalog.
    Templates,

    /// Validate a workflow definition file without activating it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Start a workflow instance from a template.
    Start {
        /// Template name (see `tflow templates`).
        template: String,

        /// Instance context as a JSON object.
        #[arg(long)]
        context: Option<String>,
    },

    /// Publish an event; starts every workflow subscribed to it.
    Event {
        /// Event name, e.g. `candidate.hired`.
        name: String,

        /// Event payload as JSON; becomes the instance context.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show an instance: status, step log, joins, variables.
    Show {
        /// Instance UUID.
        instance_id: String,
    },

    /// Cancel a running or suspended instance.
    Cancel {
        /// Instance UUID.
        instance_id: String,

        /// Reason recorded on the instance.
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// List failed instances.
    Failed {
        /// Restrict to one definition (template name or UUID).
        #[arg(long)]
        definition: Option<String>,

        /// Start of the range (RFC 3339 or YYYY-MM-DD). Defaults to 7 days ago.
        #[arg(long)]
        since: Option<String>,

        /// End of the range, exclusive. Defaults to now.
        #[arg(long)]
        until: Option<String>,
    },

    /// List the work items (tasks, approvals) of an instance.
    Work {
        /// Instance UUID.
        instance_id: String,
    },

    /// Complete a task.
    Complete {
        /// Work item UUID.
        work_id: String,

        /// Task result as JSON.
        #[arg(long)]
        result: Option<String>,
    },

    /// Approve a pending approval.
    Approve {
        /// Work item UUID.
        work_id: String,

        #[arg(long)]
        comments: Option<String>,
    },

    /// Reject a pending approval.
    Reject {
        /// Work item UUID.
        work_id: String,

        #[arg(long)]
        comments: Option<String>,
    },

    /// Run one timer pass: wake due delays, expire overdue work, archive old instances.
    Sweep,

    /// Run timer sweeps and cron triggers until Ctrl+C.
    Serve {
        /// Export spans through OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tflow", "start", "leave-approval", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.command, Commands::Start { ref template, .. } if template == "leave-approval"));
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["tflow", "-q", "-v", "templates"]).is_err());
    }

    #[test]
    fn log_filter_by_verbosity() {
        let quiet = Cli::try_parse_from(["tflow", "-q", "sweep"]).unwrap();
        assert_eq!(quiet.log_filter(), "error");
        let serve = Cli::try_parse_from(["tflow", "serve"]).unwrap();
        assert_eq!(serve.log_filter(), "info");
        let debug = Cli::try_parse_from(["tflow", "-vv", "templates"]).unwrap();
        assert_eq!(debug.log_filter(), "trace");
    }

    #[test]
    fn cancel_reason_has_default() {
        let cli = Cli::try_parse_from(["tflow", "cancel", "0190f0c2-0000-7000-8000-000000000000"]).unwrap();
        match cli.command {
            Commands::Cancel { reason, .. } => assert_eq!(reason, "cancelled by operator"),
            _ => panic!("expected cancel"),
        }
    }
}
