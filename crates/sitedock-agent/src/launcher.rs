use std::path::Path;

use anyhow::Context;

use crate::scaffold::PORT_ENV;

/// Starts and stops site processes. Process handles are not kept; the pid is
/// advisory only.
pub trait Launcher: Send + Sync + 'static {
    /// Spawns `entry` detached with `cwd` as working directory and returns
    /// its pid.
    fn launch(&self, entry: &Path, cwd: &Path, port: u16) -> anyhow::Result<u32>;

    /// Best-effort termination of a previously launched pid.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;
}

/// Runs the site's script with a configured interpreter.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    interpreter: String,
}

impl ProcessLauncher {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, entry: &Path, cwd: &Path, port: u16) -> anyhow::Result<u32> {
        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg(entry)
            .current_dir(cwd)
            .env(PORT_ENV, port.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false);

        // Own process group so the site outlives a Ctrl-C aimed at us.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {} {}", self.interpreter, entry.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned process exited before reporting a pid"))?;

        // Dropping the handle detaches; tokio reaps the child in the background.
        drop(child);
        Ok(pid)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        let pid = i32::try_from(pid).context("pid out of range")?;
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err).context(format!("kill {pid}"));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .context("run taskkill")?;
        Ok(())
    }
}

/// Hands URLs and folders to the desktop.
pub trait Opener: Send + Sync + 'static {
    fn open_url(&self, url: &str) -> anyhow::Result<()>;
    fn open_path(&self, path: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl Opener for SystemOpener {
    fn open_url(&self, url: &str) -> anyhow::Result<()> {
        open::that(url).with_context(|| format!("open {url}"))
    }

    fn open_path(&self, path: &Path) -> anyhow::Result<()> {
        open::that(path).with_context(|| format!("open {}", path.display()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_reports_pid_and_passes_port() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("run.sh");
        let marker = tmp.path().join("port.txt");
        std::fs::write(&script, format!("echo $SITE_PORT > {}\n", marker.display())).unwrap();

        let launcher = ProcessLauncher::new("sh");
        let pid = launcher.launch(&script, tmp.path(), 5123).unwrap();
        assert!(pid > 0);

        for _ in 0..100 {
            if std::fs::read_to_string(&marker).is_ok_and(|s| s.trim() == "5123") {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("launched script never wrote the port");
    }

    #[tokio::test]
    async fn launch_missing_interpreter_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("/definitely/not/an/interpreter");
        let err = launcher
            .launch(&tmp.path().join("run.sh"), tmp.path(), 5000)
            .unwrap_err();
        assert!(err.to_string().contains("spawn"));
    }

    #[test]
    fn terminate_unknown_pid_is_ok() {
        // pid_max on Linux tops out well below this.
        assert!(ProcessLauncher::new("sh").terminate(999_999_999).is_ok());
    }
}
