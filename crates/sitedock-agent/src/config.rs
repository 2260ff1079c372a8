use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_BASE_PORT: u16 = 5000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_PROBE_CACHE_MS: u64 = 2000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 8000;
const DEFAULT_OPEN_DELAY_MS: u64 = 800;
const DEFAULT_PYTHON: &str = "python3";

const ARCHIVE_DIR: &str = "_archive";
const META_FILE: &str = "sites.json";
const LOGS_DIR: &str = "logs";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_ms(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Names the data root uses for itself; a site may not take them.
pub fn is_reserved_name(name: &str) -> bool {
    name == ARCHIVE_DIR || name == LOGS_DIR || name.starts_with(META_FILE)
}

/// Filesystem layout under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePaths {
    pub sites_root: PathBuf,
    pub archive_root: PathBuf,
    pub meta_file: PathBuf,
    pub logs_dir: PathBuf,
}

impl SitePaths {
    pub fn under(data_root: impl Into<PathBuf>) -> Self {
        let root = data_root.into();
        Self {
            archive_root: root.join(ARCHIVE_DIR),
            meta_file: root.join(META_FILE),
            logs_dir: root.join(LOGS_DIR),
            sites_root: root,
        }
    }

    pub fn site_dir(&self, name: &str) -> PathBuf {
        self.sites_root.join(name)
    }

    pub fn archive_file(&self, name: &str) -> PathBuf {
        self.archive_root.join(format!("{name}.zip"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.sites_root)?;
        std::fs::create_dir_all(&self.archive_root)
    }
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub paths: SitePaths,
    pub base_port: u16,
    pub probe_timeout: Duration,
    pub probe_cache_ttl: Duration,
    pub reconcile_interval: Duration,
    pub open_delay: Duration,
    pub python: String,
}

impl SiteConfig {
    /// Defaults rooted at `data_root`; nothing is read from the environment.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SitePaths::under(data_root),
            base_port: DEFAULT_BASE_PORT,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            probe_cache_ttl: Duration::from_millis(DEFAULT_PROBE_CACHE_MS),
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            open_delay: Duration::from_millis(DEFAULT_OPEN_DELAY_MS),
            python: DEFAULT_PYTHON.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let base_port = env_u64("SITEDOCK_BASE_PORT")
            .map(|v| v.clamp(1024, u16::MAX as u64) as u16)
            .unwrap_or(DEFAULT_BASE_PORT);

        Self {
            paths: SitePaths::under(data_root()),
            base_port,
            probe_timeout: env_ms(
                "SITEDOCK_PROBE_TIMEOUT_MS",
                50,
                10_000,
                DEFAULT_PROBE_TIMEOUT_MS,
            ),
            probe_cache_ttl: env_ms("SITEDOCK_PROBE_CACHE_MS", 0, 60_000, DEFAULT_PROBE_CACHE_MS),
            reconcile_interval: env_ms(
                "SITEDOCK_RECONCILE_INTERVAL_MS",
                500,
                10 * 60 * 1000,
                DEFAULT_RECONCILE_INTERVAL_MS,
            ),
            open_delay: env_ms("SITEDOCK_OPEN_DELAY_MS", 0, 30_000, DEFAULT_OPEN_DELAY_MS),
            python: env_string("SITEDOCK_PYTHON").unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        }
    }
}

pub fn data_root() -> PathBuf {
    let raw = env_string("SITEDOCK_DATA_ROOT").unwrap_or_else(|| {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join("PersonalSites").display().to_string()
    });
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}
