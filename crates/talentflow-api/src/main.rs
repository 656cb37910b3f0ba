//! talentflow CLI entry point.
//!
//! Binary name: `tflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use talentflow_types::instance::ApprovalDecision;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let otel = matches!(cli.command, Commands::Serve { otel: true });
    talentflow_observe::init_tracing(cli.log_filter(), otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    talentflow_observe::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't need the database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "tflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => {
            if !cli::template::validate_file(file, cli.json)? {
                std::process::exit(1);
            }
            return Ok(());
        }
        _ => {}
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Templates => cli::template::list_templates(&state.catalog, json)?,

        Commands::Start { template, context } => {
            cli::instance::start(&state, &template, context.as_deref(), json).await?;
        }

        Commands::Event { name, payload } => {
            cli::instance::event(&state, &name, payload.as_deref(), json).await?;
        }

        Commands::Show { instance_id } => cli::instance::show(&state, &instance_id, json).await?,

        Commands::Cancel {
            instance_id,
            reason,
        } => cli::instance::cancel(&state, &instance_id, &reason, json).await?,

        Commands::Failed {
            definition,
            since,
            until,
        } => {
            cli::instance::failed(
                &state,
                definition.as_deref(),
                since.as_deref(),
                until.as_deref(),
                json,
            )
            .await?;
        }

        Commands::Work { instance_id } => cli::work::list_work(&state, &instance_id, json).await?,

        Commands::Complete { work_id, result } => {
            cli::work::complete(&state, &work_id, result.as_deref(), json).await?;
        }

        Commands::Approve { work_id, comments } => {
            cli::work::decide(&state, &work_id, ApprovalDecision::Approve, comments, json).await?;
        }

        Commands::Reject { work_id, comments } => {
            cli::work::decide(&state, &work_id, ApprovalDecision::Reject, comments, json).await?;
        }

        Commands::Sweep => cli::runtime::sweep(&state, json).await?,

        Commands::Serve { .. } => cli::runtime::serve(state).await?,

        Commands::Completions { .. } | Commands::Validate { .. } => unreachable!("handled above"),
    }

    Ok(())
}
