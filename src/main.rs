mod clock;
mod config;
mod control;
mod error;
mod host_backend;
mod orchestrator;
mod poller;
mod preflight;
mod release_feed;
mod version;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::clock::SystemClock;
use crate::config::{Config, ENV_LOG};
use crate::control::Controller;
use crate::host_backend::{HostBackend, LocalHostBackend};
use crate::orchestrator::{UpdateOrchestrator, UpdateSettings, UpdateState};
use crate::poller::VersionPoller;
use crate::release_feed::ReleaseFeed;
use crate::version::ReleaseTag;

const LOG_TAG: &str = "tag-upgrade-trigger";
const DEFAULT_LOG_FILTER: &str = "info";

const EXIT_FAILURE: u8 = 1;
const EXIT_REJECTED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "tag-upgrade-trigger",
    about = "Keep a git-deployed service on its latest release tag",
    disable_version_flag = true
)]
struct Cli {
    /// Print the build tag and exit.
    #[arg(long, short = 'V')]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the build tag.
    Version,
    /// Query the release feed once and print the snapshot.
    Check,
    /// Print the combined version and operation status.
    Status,
    /// Run the pre-update diagnostics.
    Preflight,
    /// Move the working copy to a newer tag and restart the service.
    Apply { tag: String },
    /// Move the working copy back to an older tag and restart the service.
    Rollback { tag: String },
    /// Poll in the background and answer JSON-line requests on stdin.
    Serve,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version || matches!(cli.command, Some(Command::Version)) {
        println!("{}", build_tag());
        return ExitCode::SUCCESS;
    }
    init_tracing();

    let Some(command) = cli.command else {
        if let Err(err) = Cli::command().print_help() {
            error!("{LOG_TAG} usage output failed err={err}");
            eprintln!("{LOG_TAG}: {err}");
        }
        return ExitCode::from(EXIT_FAILURE);
    };

    let outcome = Runtime::new()
        .context("failed to start async runtime")
        .and_then(|runtime| runtime.block_on(run(command)));
    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!("{LOG_TAG} fatal err={err:#}");
            eprintln!("{LOG_TAG}: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// `TAGUP_BUILD_TAG` wins; otherwise `v` plus the build or package version.
fn build_tag() -> String {
    if let Some(tag) = option_env!("TAGUP_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let version = option_env!("TAGUP_BUILD_VERSION")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    format!("v{version}")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // stdout carries JSON output only.
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();
}

struct App {
    poller: Arc<VersionPoller>,
    orchestrator: Arc<UpdateOrchestrator>,
    controller: Controller,
}

impl App {
    fn build(config: &Config) -> Result<Self> {
        let backend: Arc<dyn HostBackend> = Arc::new(LocalHostBackend::new(config.workdir.clone()));
        info!("working copy path={}", backend.workdir().display());
        let clock = Arc::new(SystemClock);
        let feed = ReleaseFeed::new(config.feed.clone()).context("failed to build release feed client")?;
        if !feed.is_configured() {
            warn!("release feed not configured; set TAGUP_REPO to enable update checks");
        }
        let poller = Arc::new(VersionPoller::new(
            feed,
            Arc::clone(&backend),
            clock.clone(),
            config.poll_interval,
            config.tag_order,
        ));
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            Arc::clone(&backend),
            clock,
            UpdateSettings::from_config(config),
        ));
        let controller = Controller::new(Arc::clone(&poller), Arc::clone(&orchestrator), backend);
        Ok(Self {
            poller,
            orchestrator,
            controller,
        })
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    let config = Config::from_env().context("invalid configuration")?;
    info!(
        "{LOG_TAG} starting profile={:?} unit={}",
        config.profile,
        config.service_unit.as_str()
    );
    let app = App::build(&config)?;

    match command {
        Command::Version => {
            println!("{}", build_tag());
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => match app.poller.refresh().await {
            Ok(snapshot) => {
                print_json(&snapshot)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                error!("update check failed code={} err={err}", err.code());
                eprintln!("check failed: {err}");
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        },
        Command::Status => {
            app.poller.fetch().await;
            print_json(&app.controller.status().await)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Preflight => {
            let report = app.orchestrator.preflight_check().await;
            print_json(&report)?;
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FAILURE)
            })
        }
        Command::Apply { tag } => run_update(&app, "apply", &tag).await,
        Command::Rollback { tag } => run_update(&app, "rollback", &tag).await,
        Command::Serve => {
            let poll_task = app.poller.start();
            let result = app
                .controller
                .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await;
            poll_task.abort();
            info!("{LOG_TAG} control input closed");
            if app.orchestrator.is_busy() {
                info!("{LOG_TAG} waiting for running update before exit");
            }
            app.orchestrator.wait_idle().await;
            result.context("control channel failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Foreground run: wait for the pipeline and report its final status.
async fn run_update(app: &App, action: &str, raw_tag: &str) -> Result<ExitCode> {
    let tag = match ReleaseTag::parse(raw_tag) {
        Ok(tag) => tag,
        Err(err) => {
            eprintln!("{action} rejected: {err}");
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
    };
    let mut transitions = app.orchestrator.subscribe();
    let mut handle = match app.orchestrator.try_update_to_tag(&tag) {
        Ok(handle) => handle,
        Err(conflict) => {
            eprintln!("{action} rejected: {conflict}");
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
    };
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            Ok(status) = transitions.recv() => eprintln!("[{action}] {}", status.message),
        }
    };
    while let Ok(status) = transitions.try_recv() {
        eprintln!("[{action}] {}", status.message);
    }
    joined.context("update task failed to join")?;

    let status = app.orchestrator.status();
    print_json(&status)?;
    Ok(match status.state {
        UpdateState::Idle => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_FAILURE),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}
