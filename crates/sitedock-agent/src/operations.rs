use std::sync::Arc;

use anyhow::Context;
use sitedock_site::{Outcome, site_url};
use tokio::task::JoinHandle;

use crate::archive;
use crate::config::SitePaths;
use crate::error::format_error_chain;
use crate::launcher::Launcher;
use crate::scaffold;

/// Long-running lifecycle actions. None of them touch the metadata map; the
/// controller applies their outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create { name: String, port: u16 },
    Start { name: String, port: u16 },
    Archive { name: String, stop_pid: Option<u32> },
    Restore { name: String },
    Delete { name: String, stop_pid: Option<u32> },
    DeleteArchive { name: String },
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Create { name, .. }
            | Operation::Start { name, .. }
            | Operation::Archive { name, .. }
            | Operation::Restore { name }
            | Operation::Delete { name, .. }
            | Operation::DeleteArchive { name } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Start { .. } => "start",
            Operation::Archive { .. } => "archive",
            Operation::Restore { .. } => "restore",
            Operation::Delete { .. } => "delete",
            Operation::DeleteArchive { .. } => "delete-archive",
        }
    }
}

/// What an operation may touch.
#[derive(Clone)]
pub struct OperationContext {
    pub paths: SitePaths,
    pub launcher: Arc<dyn Launcher>,
}

/// Resolves to the operation's single terminal outcome.
pub struct OperationHandle {
    join: JoinHandle<Outcome>,
}

impl OperationHandle {
    pub async fn outcome(self) -> Outcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Outcome::failed(format!("operation panicked: {e}")),
            Err(e) => Outcome::failed(format!("operation aborted: {e}")),
        }
    }
}

/// Runs `op` on its own task.
pub fn dispatch(op: Operation, ctx: OperationContext) -> OperationHandle {
    OperationHandle {
        join: tokio::spawn(run(op, ctx)),
    }
}

/// Runs `op` to completion, converting every fault into a failure outcome.
pub async fn run(op: Operation, ctx: OperationContext) -> Outcome {
    let kind = op.kind();
    let name = op.name().to_string();

    let res = match tokio::task::spawn_blocking(move || run_blocking(op, &ctx)).await {
        Ok(res) => res,
        Err(e) => Err(anyhow::anyhow!("{kind} task failed: {e}")),
    };

    match res {
        Ok(outcome) => {
            tracing::info!(site = %name, op = kind, success = outcome.success, detail = %outcome.message, "operation finished");
            outcome
        }
        Err(err) => {
            let message = format_error_chain(&err);
            tracing::warn!(site = %name, op = kind, error = %message, "operation failed");
            Outcome::failed(message)
        }
    }
}

fn run_blocking(op: Operation, ctx: &OperationContext) -> anyhow::Result<Outcome> {
    match op {
        Operation::Create { name, port } => create_site(ctx, &name, port),
        Operation::Start { name, port } => start_site(ctx, &name, port),
        Operation::Archive { name, stop_pid } => archive_site(ctx, &name, stop_pid),
        Operation::Restore { name } => restore_site(ctx, &name),
        Operation::Delete { name, stop_pid } => delete_site(ctx, &name, stop_pid),
        Operation::DeleteArchive { name } => delete_archive(ctx, &name),
    }
}

fn create_site(ctx: &OperationContext, name: &str, port: u16) -> anyhow::Result<Outcome> {
    let site_dir = ctx.paths.site_dir(name);
    if site_dir.exists() {
        return Ok(Outcome::failed("Site folder already exists"));
    }

    scaffold::write_scaffold(&site_dir, name, port)?;
    Ok(Outcome::ok(format!(
        "Site '{name}' created at {}",
        site_url(port)
    )))
}

/// Success message is the pid, for the controller to parse.
fn start_site(ctx: &OperationContext, name: &str, port: u16) -> anyhow::Result<Outcome> {
    let site_dir = ctx.paths.site_dir(name);
    let entry = scaffold::entry_point(&site_dir);
    if !entry.is_file() {
        return Ok(Outcome::failed(format!("{} not found.", scaffold::ENTRY_POINT)));
    }

    let pid = ctx.launcher.launch(&entry, &site_dir, port)?;
    Ok(Outcome::ok(pid.to_string()))
}

fn stop_best_effort(ctx: &OperationContext, name: &str, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = ctx.launcher.terminate(pid) {
        tracing::warn!(site = %name, pid, error = %format_error_chain(&e), "failed to stop site process");
    }
}

fn remove_dir_best_effort(dir: &std::path::Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "failed to remove directory"),
    }
}

fn archive_site(ctx: &OperationContext, name: &str, stop_pid: Option<u32>) -> anyhow::Result<Outcome> {
    let site_dir = ctx.paths.site_dir(name);
    stop_best_effort(ctx, name, stop_pid);

    std::fs::create_dir_all(&ctx.paths.archive_root).context("create archive area")?;
    archive::compress_dir(&site_dir, &ctx.paths.archive_file(name))?;
    remove_dir_best_effort(&site_dir);
    Ok(Outcome::ok(format!("Archived {name}")))
}

fn restore_site(ctx: &OperationContext, name: &str) -> anyhow::Result<Outcome> {
    let zip_path = ctx.paths.archive_file(name);
    if !zip_path.is_file() {
        return Ok(Outcome::failed("Archive not found."));
    }

    std::fs::create_dir_all(&ctx.paths.sites_root).context("create sites root")?;
    archive::extract_zip_safely(&zip_path, &ctx.paths.site_dir(name))?;
    Ok(Outcome::ok(format!("Restored {name}")))
}

fn delete_site(ctx: &OperationContext, name: &str, stop_pid: Option<u32>) -> anyhow::Result<Outcome> {
    stop_best_effort(ctx, name, stop_pid);
    remove_dir_best_effort(&ctx.paths.site_dir(name));
    remove_file_if_exists(&ctx.paths.archive_file(name))?;
    Ok(Outcome::ok(format!("Deleted {name}")))
}

fn delete_archive(ctx: &OperationContext, name: &str) -> anyhow::Result<Outcome> {
    remove_file_if_exists(&ctx.paths.archive_file(name))?;
    Ok(Outcome::ok(format!("Deleted archive {name}")))
}

fn remove_file_if_exists(path: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use crate::launcher::{Launcher, Opener};

    #[derive(Default)]
    pub struct FakeLauncher {
        pub launched: Mutex<Vec<(PathBuf, u16)>>,
        pub terminated: Mutex<Vec<u32>>,
        pub fail: bool,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, entry: &Path, _cwd: &Path, port: u16) -> anyhow::Result<u32> {
            if self.fail {
                anyhow::bail!("interpreter missing");
            }
            self.launched.lock().unwrap().push((entry.to_path_buf(), port));
            Ok(4242)
        }

        fn terminate(&self, pid: u32) -> anyhow::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeOpener {
        pub urls: Mutex<Vec<String>>,
        pub paths: Mutex<Vec<PathBuf>>,
    }

    impl Opener for FakeOpener {
        fn open_url(&self, url: &str) -> anyhow::Result<()> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(())
        }

        fn open_path(&self, path: &Path) -> anyhow::Result<()> {
            self.paths.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }
}
