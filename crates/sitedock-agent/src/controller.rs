use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use sitedock_site::{Outcome, SiteMap, SiteRecord, SiteStatus, SiteView, site_url};
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};

use crate::config::SiteConfig;
use crate::error::{LifecycleError, format_error_chain};
use crate::launcher::{Launcher, Opener};
use crate::metadata_store::MetadataStore;
use crate::operations::{self, Operation, OperationContext};
use crate::port_alloc;
use crate::port_probe::PortProbe;

const COMMAND_QUEUE: usize = 64;

type Reply = Result<Outcome, LifecycleError>;

/// Caller-facing lifecycle requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Start,
    Open,
    OpenFolder,
    Archive,
    Restore,
    Delete,
    DeleteArchive,
}

enum Command {
    Lifecycle {
        action: Action,
        name: String,
        reply: oneshot::Sender<Reply>,
    },
    List {
        reply: oneshot::Sender<Vec<SiteView>>,
    },
    Reconcile {
        reply: oneshot::Sender<ReconcileReport>,
    },
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sites whose status flipped, in name order.
    pub changed: Vec<String>,
    /// Whether the store was written (at most once per pass).
    pub persisted: bool,
}

/// Metadata mutation to perform once an operation reports back.
#[derive(Debug, Clone, Copy)]
enum Followup {
    Create { port: u16 },
    Start { open_after: bool },
    Archive,
    Restore { port: u16 },
    Delete,
    DeleteArchive,
}

struct Completion {
    name: String,
    followup: Followup,
    outcome: Outcome,
    reply: oneshot::Sender<Reply>,
}

/// Trims and lowercases `raw`, then checks it is usable as a site name.
pub fn normalize_site_name(raw: &str) -> Result<String, LifecycleError> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        return Err(LifecycleError::EmptyName);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(LifecycleError::NameHasWhitespace);
    }

    // One safe path segment, never colliding with the data root's own entries.
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !first_ok || !chars_ok || crate::config::is_reserved_name(&name) {
        return Err(LifecycleError::InvalidName(name));
    }
    Ok(name)
}

/// Canonical form of a name that should already be in the store.
fn lookup_name(raw: &str) -> Result<String, LifecycleError> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        return Err(LifecycleError::EmptyName);
    }
    Ok(name)
}

/// Applies live probe results to active records. Returns the names whose
/// status changed; records in `skip` are left alone.
pub fn apply_probe_results(
    sites: &mut SiteMap,
    live: &HashMap<u16, bool>,
    skip: &HashSet<String>,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (name, rec) in sites.iter_mut() {
        if !rec.is_active() || skip.contains(name) {
            continue;
        }
        let Some(&running) = live.get(&rec.port) else {
            continue;
        };
        match (running, rec.status) {
            (true, SiteStatus::Stopped) => {
                rec.mark_running(None);
                changed.push(name.clone());
            }
            (false, SiteStatus::Running) => {
                rec.mark_stopped();
                changed.push(name.clone());
            }
            _ => {}
        }
    }
    changed
}

/// Cloneable front door to a running [`SiteController`].
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub async fn request(&self, action: Action, name: &str) -> Reply {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Lifecycle {
                action,
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| LifecycleError::ControllerGone)?;
        rx.await.map_err(|_| LifecycleError::ControllerGone)?
    }

    pub async fn create(&self, name: &str) -> Reply {
        self.request(Action::Create, name).await
    }

    pub async fn start(&self, name: &str) -> Reply {
        self.request(Action::Start, name).await
    }

    pub async fn open(&self, name: &str) -> Reply {
        self.request(Action::Open, name).await
    }

    pub async fn open_folder(&self, name: &str) -> Reply {
        self.request(Action::OpenFolder, name).await
    }

    pub async fn archive(&self, name: &str) -> Reply {
        self.request(Action::Archive, name).await
    }

    pub async fn restore(&self, name: &str) -> Reply {
        self.request(Action::Restore, name).await
    }

    pub async fn delete(&self, name: &str) -> Reply {
        self.request(Action::Delete, name).await
    }

    pub async fn delete_archive(&self, name: &str) -> Reply {
        self.request(Action::DeleteArchive, name).await
    }

    pub async fn list(&self) -> Result<Vec<SiteView>, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::List { reply })
            .await
            .map_err(|_| LifecycleError::ControllerGone)?;
        rx.await.map_err(|_| LifecycleError::ControllerGone)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reconcile { reply })
            .await
            .map_err(|_| LifecycleError::ControllerGone)?;
        rx.await.map_err(|_| LifecycleError::ControllerGone)
    }
}

/// Owns the site map, probe cache and in-flight bookkeeping. Runs as a single
/// task; every metadata read and write happens here.
pub struct SiteController {
    cfg: SiteConfig,
    store: MetadataStore,
    sites: SiteMap,
    probe: PortProbe,
    ops: OperationContext,
    opener: Arc<dyn Opener>,
    in_flight: HashSet<String>,
    reserved_ports: HashSet<u16>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    open_tasks: JoinSet<()>,
}

impl SiteController {
    pub fn new(
        cfg: SiteConfig,
        launcher: Arc<dyn Launcher>,
        opener: Arc<dyn Opener>,
    ) -> anyhow::Result<Self> {
        cfg.paths.ensure_dirs().context("create data root")?;
        let store = MetadataStore::new(cfg.paths.meta_file.clone());
        let sites = store.load();
        tracing::info!(
            sites = sites.len(),
            path = %store.path().display(),
            "loaded site metadata"
        );

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Ok(Self {
            probe: PortProbe::new(cfg.probe_timeout, cfg.probe_cache_ttl),
            ops: OperationContext {
                paths: cfg.paths.clone(),
                launcher,
            },
            opener,
            store,
            sites,
            in_flight: HashSet::new(),
            reserved_ports: HashSet::new(),
            completions_tx,
            completions_rx,
            open_tasks: JoinSet::new(),
            cfg,
        })
    }

    /// Starts the controller task. It exits once every handle is dropped and
    /// outstanding work has been applied.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let join = tokio::spawn(self.run(rx));
        (ControllerHandle { tx }, join)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let period = self.cfg.reconcile_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(done) = self.completions_rx.recv() => self.apply(done),
                _ = ticker.tick() => {
                    let report = self.reconcile().await;
                    if !report.changed.is_empty() {
                        tracing::info!(changed = ?report.changed, "reconciled site status");
                    }
                }
                Some(_) = self.open_tasks.join_next(), if !self.open_tasks.is_empty() => {}
            }
        }

        self.drain().await;
        tracing::debug!("site controller stopped");
    }

    async fn drain(&mut self) {
        while !self.in_flight.is_empty() {
            match self.completions_rx.recv().await {
                Some(done) => self.apply(done),
                None => break,
            }
        }
        while self.open_tasks.join_next().await.is_some() {}
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Lifecycle {
                action,
                name,
                reply,
            } => {
                if let Err(e) = self.begin(action, &name, reply).await {
                    tracing::debug!(site = %name, ?action, error = %e, "request rejected");
                }
            }
            Command::List { reply } => {
                let _ = reply.send(self.list());
            }
            Command::Reconcile { reply } => {
                let report = self.reconcile().await;
                let _ = reply.send(report);
            }
        }
    }

    fn list(&self) -> Vec<SiteView> {
        self.sites
            .iter()
            .map(|(name, rec)| SiteView::new(name.clone(), rec.clone()))
            .collect()
    }

    /// Validates and dispatches, or answers `reply` directly. Rejections are
    /// sent to the caller and also returned for logging.
    async fn begin(
        &mut self,
        action: Action,
        raw_name: &str,
        reply: oneshot::Sender<Reply>,
    ) -> Result<(), LifecycleError> {
        match self.prepare(action, raw_name).await {
            Ok(Prepared::Done(outcome)) => {
                let _ = reply.send(Ok(outcome));
                Ok(())
            }
            Ok(Prepared::Open(target, done)) => {
                self.spawn_open(target, done, reply);
                Ok(())
            }
            Ok(Prepared::Dispatch(op, followup)) => {
                self.dispatch(op, followup, reply);
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    async fn prepare(&mut self, action: Action, raw_name: &str) -> Result<Prepared, LifecycleError> {
        match action {
            Action::Create => {
                let name = normalize_site_name(raw_name)?;
                if self.sites.contains_key(&name) {
                    return Err(LifecycleError::AlreadyExists(name));
                }
                self.ensure_idle(&name)?;
                let port = self.reserve_port()?;
                self.probe.invalidate_all();
                Ok(Prepared::Dispatch(
                    Operation::Create { name, port },
                    Followup::Create { port },
                ))
            }
            Action::Start => {
                let name = lookup_name(raw_name)?;
                let port = self.active_record(&name)?.port;
                self.ensure_idle(&name)?;
                Ok(Prepared::Dispatch(
                    Operation::Start { name, port },
                    Followup::Start { open_after: false },
                ))
            }
            Action::Open => {
                let name = lookup_name(raw_name)?;
                let port = self.active_record(&name)?.port;
                self.ensure_idle(&name)?;
                if self.probe.in_use(port).await {
                    return Ok(Prepared::Open(
                        OpenTarget::Url(site_url(port)),
                        format!("Opened {name} in browser"),
                    ));
                }
                Ok(Prepared::Dispatch(
                    Operation::Start { name, port },
                    Followup::Start { open_after: true },
                ))
            }
            Action::OpenFolder => {
                let name = lookup_name(raw_name)?;
                self.active_record(&name)?;
                let dir = self.cfg.paths.site_dir(&name);
                if !dir.is_dir() {
                    return Ok(Prepared::Done(Outcome::failed(format!(
                        "Folder for {name} not found."
                    ))));
                }
                Ok(Prepared::Open(
                    OpenTarget::Folder(dir),
                    format!("Opened folder for {name}"),
                ))
            }
            Action::Archive => {
                let name = lookup_name(raw_name)?;
                let rec = self.active_record(&name)?.clone();
                self.ensure_idle(&name)?;
                let stop_pid = self.live_pid(&rec).await;
                Ok(Prepared::Dispatch(
                    Operation::Archive { name, stop_pid },
                    Followup::Archive,
                ))
            }
            Action::Delete => {
                let name = lookup_name(raw_name)?;
                let rec = self.active_record(&name)?.clone();
                self.ensure_idle(&name)?;
                let stop_pid = self.live_pid(&rec).await;
                Ok(Prepared::Dispatch(
                    Operation::Delete { name, stop_pid },
                    Followup::Delete,
                ))
            }
            Action::Restore => {
                let name = lookup_name(raw_name)?;
                self.archived_record(&name)?;
                self.ensure_idle(&name)?;
                let port = self.reserve_port()?;
                Ok(Prepared::Dispatch(
                    Operation::Restore { name },
                    Followup::Restore { port },
                ))
            }
            Action::DeleteArchive => {
                let name = lookup_name(raw_name)?;
                self.archived_record(&name)?;
                self.ensure_idle(&name)?;
                Ok(Prepared::Dispatch(
                    Operation::DeleteArchive { name },
                    Followup::DeleteArchive,
                ))
            }
        }
    }

    /// Next free port, held back from other allocations until the operation
    /// that asked for it completes.
    fn reserve_port(&mut self) -> Result<u16, LifecycleError> {
        let port = port_alloc::next_free_port_excluding(
            &self.sites,
            self.cfg.base_port,
            &self.reserved_ports,
        )
        .ok_or(LifecycleError::NoFreePort(self.cfg.base_port))?;
        self.reserved_ports.insert(port);
        Ok(port)
    }

    fn active_record(&self, name: &str) -> Result<&SiteRecord, LifecycleError> {
        match self.sites.get(name) {
            None => Err(LifecycleError::NotFound(name.to_string())),
            Some(rec) if !rec.is_active() => Err(LifecycleError::Archived(name.to_string())),
            Some(rec) => Ok(rec),
        }
    }

    fn archived_record(&self, name: &str) -> Result<&SiteRecord, LifecycleError> {
        match self.sites.get(name) {
            None => Err(LifecycleError::NotFound(name.to_string())),
            Some(rec) if rec.is_active() => Err(LifecycleError::NotArchived(name.to_string())),
            Some(rec) => Ok(rec),
        }
    }

    fn ensure_idle(&self, name: &str) -> Result<(), LifecycleError> {
        if self.in_flight.contains(name) {
            return Err(LifecycleError::Busy(name.to_string()));
        }
        Ok(())
    }

    /// Recorded pid, but only while its port still answers.
    async fn live_pid(&mut self, rec: &SiteRecord) -> Option<u32> {
        let pid = rec.pid?;
        self.probe.in_use(rec.port).await.then_some(pid)
    }

    fn dispatch(&mut self, op: Operation, followup: Followup, reply: oneshot::Sender<Reply>) {
        let name = op.name().to_string();
        tracing::info!(site = %name, op = op.kind(), "dispatching operation");
        self.in_flight.insert(name.clone());

        let handle = operations::dispatch(op, self.ops.clone());
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = handle.outcome().await;
            let _ = tx.send(Completion {
                name,
                followup,
                outcome,
                reply,
            });
        });
    }

    /// Commits an operation's outcome, persists, then answers the caller.
    fn apply(&mut self, done: Completion) {
        let Completion {
            name,
            followup,
            mut outcome,
            reply,
        } = done;
        self.in_flight.remove(&name);

        match followup {
            Followup::Create { port } => {
                self.reserved_ports.remove(&port);
                if outcome.success {
                    self.sites.insert(name.clone(), SiteRecord::stopped(port));
                }
            }
            Followup::Start { open_after } => {
                if outcome.success {
                    let pid = outcome.message.trim().parse::<u32>().ok();
                    let port = match self.sites.get_mut(&name) {
                        Some(rec) => {
                            rec.mark_running(pid);
                            rec.port
                        }
                        None => 0,
                    };
                    let pid_note = pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
                    if open_after && port != 0 {
                        self.schedule_open(site_url(port));
                        outcome.message = format!("{name} started and opened in browser{pid_note}");
                    } else {
                        outcome.message = format!("{name} started successfully{pid_note}");
                    }
                } else {
                    outcome.message = format!("Failed to start {name}: {}", outcome.message);
                }
            }
            Followup::Archive => {
                if outcome.success
                    && let Some(rec) = self.sites.get_mut(&name)
                {
                    rec.mark_archived();
                }
            }
            Followup::Restore { port } => {
                self.reserved_ports.remove(&port);
                if outcome.success {
                    self.sites.insert(name.clone(), SiteRecord::stopped(port));
                }
            }
            Followup::Delete | Followup::DeleteArchive => {
                if outcome.success {
                    self.sites.remove(&name);
                }
            }
        }

        self.probe.invalidate_all();
        if outcome.success
            && let Err(e) = self.persist()
        {
            outcome.message = format!(
                "{} (warning: site metadata not saved: {})",
                outcome.message,
                format_error_chain(&e)
            );
        }

        let _ = reply.send(Ok(outcome));
    }

    /// Opens `target` off the controller task and answers the caller once
    /// the desktop handler returns.
    fn spawn_open(&mut self, target: OpenTarget, done: String, reply: oneshot::Sender<Reply>) {
        let opener = self.opener.clone();
        self.open_tasks.spawn(async move {
            let outcome = match target.open(opener).await {
                Ok(()) => Outcome::ok(done),
                Err(e) => Outcome::failed(format_error_chain(&e)),
            };
            let _ = reply.send(Ok(outcome));
        });
    }

    fn schedule_open(&mut self, url: String) {
        let opener = self.opener.clone();
        let delay = self.cfg.open_delay;
        self.open_tasks.spawn(async move {
            // Heuristic wait for the process to start listening.
            tokio::time::sleep(delay).await;
            if let Err(e) = OpenTarget::Url(url.clone()).open(opener).await {
                tracing::warn!(%url, error = %format_error_chain(&e), "failed to open browser");
            }
        });
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.store.save(&self.sites).inspect_err(|e| {
            tracing::warn!(error = %format_error_chain(e), "failed to save site metadata");
        })
    }

    /// Re-probes every idle active site and saves once if anything flipped.
    async fn reconcile(&mut self) -> ReconcileReport {
        let ports: Vec<u16> = self
            .sites
            .iter()
            .filter(|(name, rec)| rec.is_active() && !self.in_flight.contains(*name))
            .map(|(_, rec)| rec.port)
            .collect();
        if ports.is_empty() {
            return ReconcileReport::default();
        }

        let live = self.probe.in_use_many(&ports).await;
        let changed = apply_probe_results(&mut self.sites, &live, &self.in_flight);
        let persisted = !changed.is_empty() && self.persist().is_ok();
        ReconcileReport { changed, persisted }
    }
}

enum Prepared {
    /// Answered without background work.
    Done(Outcome),
    /// Handed to the desktop; the string is the success message.
    Open(OpenTarget, String),
    Dispatch(Operation, Followup),
}

enum OpenTarget {
    Url(String),
    Folder(PathBuf),
}

impl OpenTarget {
    /// System openers may wait on the launched handler, so this runs on the
    /// blocking pool.
    async fn open(self, opener: Arc<dyn Opener>) -> anyhow::Result<()> {
        tokio::task::spawn_blocking(move || match self {
            OpenTarget::Url(url) => opener.open_url(&url),
            OpenTarget::Folder(dir) => opener.open_path(&dir),
        })
        .await
        .context("open task failed")?
    }
}
