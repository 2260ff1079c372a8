use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use sitedock_site::SiteMap;

/// JSON file holding every site record.
///
/// Only the controller writes it; readers in the same process go through the
/// controller's in-memory map.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Missing file reads as empty. A malformed file also reads as empty so a
    /// corrupted store never blocks startup.
    pub fn load(&self) -> SiteMap {
        let raw = match std::fs::read(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SiteMap::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read site metadata");
                return SiteMap::new();
            }
        };

        match serde_json::from_slice::<SiteMap>(&raw) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "site metadata is malformed; starting with an empty store"
                );
                SiteMap::new()
            }
        }
    }

    /// Replaces the whole file: write a sibling temp file, then rename over.
    pub fn save(&self, sites: &SiteMap) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("create metadata dir")?;
        }

        let tmp = self.tmp_path();
        let data = serde_json::to_vec_pretty(sites).context("serialize site metadata")?;
        let mut f = std::fs::File::create(&tmp).context("create sites.json.tmp")?;
        f.write_all(&data).context("write sites.json.tmp")?;
        f.flush().context("flush sites.json.tmp")?;
        f.sync_all().ok();
        drop(f);

        std::fs::rename(&tmp, &self.path).context("persist sites.json")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedock_site::{SiteRecord, SiteStatus};

    fn sample() -> SiteMap {
        let mut map = SiteMap::new();
        map.insert("blog".to_string(), SiteRecord::stopped(5000));
        let mut shop = SiteRecord::stopped(5001);
        shop.mark_running(Some(4242));
        map.insert("shop".to_string(), shop);
        let mut old = SiteRecord::stopped(5000);
        old.mark_archived();
        map.insert("old".to_string(), old);
        map
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(tmp.path().join("sites.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn malformed_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sites.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(MetadataStore::new(&path).load().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(tmp.path().join("sites.json"));
        let map = sample();
        store.save(&map).unwrap();
        assert_eq!(store.load(), map);

        // And again: save(load(x)) leaves the file content unchanged.
        let before = std::fs::read(store.path()).unwrap();
        store.save(&store.load()).unwrap();
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(tmp.path().join("nested").join("sites.json"));
        store.save(&sample()).unwrap();
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn persisted_format_is_plain_json_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(tmp.path().join("sites.json"));
        store.save(&sample()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains('\n'), "expected pretty-printed output");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["shop"]["pid"], 4242);
        assert_eq!(v["shop"]["status"], "Running");
        assert_eq!(v["blog"]["pid"], serde_json::Value::Null);
        assert_eq!(v["old"]["archived"], true);
        assert_eq!(v["old"]["status"], SiteStatus::Archived.as_str());
    }

    #[test]
    fn stale_temp_file_does_not_affect_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(tmp.path().join("sites.json"));
        store.save(&sample()).unwrap();
        // Simulate a crash between temp write and rename.
        std::fs::write(store.tmp_path(), b"{\"half\":").unwrap();
        assert_eq!(store.load(), sample());
    }
}
