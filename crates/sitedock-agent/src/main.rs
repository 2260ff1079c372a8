use std::{path::Path, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sitedock_agent::{
    Action, ControllerHandle, LifecycleError, SiteController,
    config::SiteConfig,
    launcher::{ProcessLauncher, SystemOpener},
};
use sitedock_site::Outcome;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sitedock", version, about = "Scaffold, run, archive and restore local web sites")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Show every site with its port and live status.
    List,
    /// Scaffold a new site on the next free port.
    Create { name: String },
    /// Launch a site's run script in the background.
    Start { name: String },
    /// Open a site in the browser, starting it first if needed.
    Open { name: String },
    /// Open a site's folder.
    Folder { name: String },
    /// Zip a site into the archive area and remove its folder.
    Archive { name: String },
    /// Bring an archived site back on a fresh port.
    Restore { name: String },
    /// Permanently remove an active site.
    Delete { name: String },
    /// Permanently remove an archived site.
    DeleteArchive { name: String },
    /// Keep reconciling site status until Ctrl-C.
    Watch,
}

fn init_tracing(logs_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    if std::fs::create_dir_all(logs_dir).is_err() {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(logs_dir, "sitedock.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

fn report(res: Result<Outcome, LifecycleError>) -> bool {
    match res {
        Ok(outcome) if outcome.success => {
            println!("{}", outcome.message);
            true
        }
        Ok(outcome) => {
            eprintln!("error: {}", outcome.message);
            false
        }
        Err(e) => {
            eprintln!("error: {e}");
            false
        }
    }
}

async fn list(handle: &ControllerHandle) -> anyhow::Result<bool> {
    handle.reconcile().await?;
    let sites = handle.list().await?;
    if sites.is_empty() {
        println!("no sites yet");
        return Ok(true);
    }
    let width = sites.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for site in sites {
        let url = if site.record.archived { "-" } else { site.url.as_str() };
        println!(
            "{:<width$}  {:<8}  {}",
            site.name, site.record.status, url
        );
    }
    Ok(true)
}

async fn run(cmd: Cmd, handle: &ControllerHandle) -> anyhow::Result<bool> {
    let (action, name) = match cmd {
        Cmd::List => return list(handle).await,
        Cmd::Watch => {
            let pass = handle.reconcile().await?;
            tracing::info!(changed = ?pass.changed, "watching site status; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
            return Ok(true);
        }
        Cmd::Create { name } => (Action::Create, name),
        Cmd::Start { name } => (Action::Start, name),
        Cmd::Open { name } => (Action::Open, name),
        Cmd::Folder { name } => (Action::OpenFolder, name),
        Cmd::Archive { name } => (Action::Archive, name),
        Cmd::Restore { name } => (Action::Restore, name),
        Cmd::Delete { name } => (Action::Delete, name),
        Cmd::DeleteArchive { name } => (Action::DeleteArchive, name),
    };
    Ok(report(handle.request(action, &name).await))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = SiteConfig::from_env();
    let _log_guard = init_tracing(&cfg.paths.logs_dir);
    tracing::debug!(data_root = %cfg.paths.sites_root.display(), "sitedock starting");

    let launcher = Arc::new(ProcessLauncher::new(cfg.python.clone()));
    let controller = SiteController::new(cfg, launcher, Arc::new(SystemOpener))?;
    let (handle, join) = controller.spawn();

    let ok = run(cli.command, &handle).await?;

    // Lets pending work (e.g. a delayed browser open) finish before exit.
    drop(handle);
    join.await.context("site controller task")?;

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
