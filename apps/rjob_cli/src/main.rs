mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rjob_engine::{JobLayout, Orchestrator};
use rjob_model::{OrchestratorStatus, ResultStatus, Stage};
use rjob_remote::config::{EnvSettings, SettingsProvider, StaticSettings};
use rjob_remote::mock::MockHost;
use rjob_remote::ssh::SshConnector;
use rjob_remote::DynRemoteConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rjob", about = "Run one Python job at a time on a remote host over SSH")]
struct Cli {
    /// Emit logs as JSON on stderr
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON tool requests, one per line, on stdin/stdout
    Serve,
    /// Submit a script and follow it until it finishes
    Run {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        work_dir: PathBuf,
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let orchestrator = build_orchestrator();
    match cli.command {
        Commands::Serve => {
            serve(orchestrator).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            script,
            work_dir,
            poll_ms,
        } => run(orchestrator, script, work_dir, Duration::from_millis(poll_ms.max(10))).await,
    }
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn build_orchestrator() -> Orchestrator {
    let layout = JobLayout::from_env();
    let (connector, settings): (DynRemoteConnector, Arc<dyn SettingsProvider>) =
        if env_flag("RJOB_USE_MOCK_REMOTE") {
            let root = env_path("RJOB_MOCK_ROOT", std::env::temp_dir().join("rjob-mock"));
            info!("using mock remote host rooted at {}", root.display());
            (
                Arc::new(MockHost::new(root)),
                Arc::new(StaticSettings(MockHost::settings())),
            )
        } else {
            (Arc::new(SshConnector), Arc::new(EnvSettings))
        };
    Orchestrator::with_layout(connector, settings, layout)
}

async fn serve(orchestrator: Orchestrator) -> Result<()> {
    tools::serve_lines(
        &orchestrator,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;

    if orchestrator.get_status().status == OrchestratorStatus::Running {
        info!("input closed, waiting for the running job to finish");
        while orchestrator.get_status().status == OrchestratorStatus::Running {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(())
}

async fn run(
    orchestrator: Orchestrator,
    script: PathBuf,
    work_dir: PathBuf,
    poll: Duration,
) -> Result<ExitCode> {
    let response = orchestrator.submit(&script, &work_dir);
    let Some(job_id) = response.job_id else {
        eprintln!("submission rejected: {}", response.message);
        return Ok(ExitCode::FAILURE);
    };
    println!("job {job_id} accepted");

    let mut last_seen: Option<(Stage, u8)> = None;
    let mut interrupted = false;
    loop {
        let status = orchestrator.get_status();
        if let Some(job) = &status.job {
            let current = (job.stage, job.progress_pct);
            if last_seen != Some(current) {
                println!("[{}] {}%", job.stage, job.progress_pct);
                last_seen = Some(current);
            }
        }
        if status.status != OrchestratorStatus::Running {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(err) = signal {
                    warn!("listening for ctrl-c failed: {err}");
                }
                interrupted = true;
                let response = orchestrator
                    .terminate_current_task("interrupted", tools::DEFAULT_GRACE_SECONDS)
                    .await;
                println!("{}", response.message);
                if let Some(warning) = response.warning {
                    eprintln!("warning: {warning}");
                }
            }
        }
    }

    let Some(result) = orchestrator.get_last_result().result else {
        eprintln!("job {job_id} ended without a result");
        return Ok(ExitCode::FAILURE);
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.status == ResultStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_path(var: &str, default: PathBuf) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}
