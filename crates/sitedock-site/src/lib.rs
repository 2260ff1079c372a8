use std::collections::BTreeMap;

/// Loopback host every managed site binds to.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Lifecycle state recorded for a site.
///
/// NOTE: `Running` is a cache of the last successful probe, not a guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SiteStatus {
    Stopped,
    Running,
    Archived,
}

impl SiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Stopped => "Stopped",
            SiteStatus::Running => "Running",
            SiteStatus::Archived => "Archived",
        }
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SiteRecord {
    pub port: u16,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: SiteStatus,
    // Mirrors `status == Archived`; kept explicit so listings can filter on it.
    #[serde(default)]
    pub archived: bool,
}

impl SiteRecord {
    /// Fresh record for a site that was just created or restored.
    pub fn stopped(port: u16) -> Self {
        Self {
            port,
            pid: None,
            status: SiteStatus::Stopped,
            archived: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.archived
    }

    pub fn mark_running(&mut self, pid: Option<u32>) {
        self.status = SiteStatus::Running;
        if pid.is_some() {
            self.pid = pid;
        }
    }

    pub fn mark_stopped(&mut self) {
        self.status = SiteStatus::Stopped;
        self.pid = None;
    }

    pub fn mark_archived(&mut self) {
        self.status = SiteStatus::Archived;
        self.archived = true;
        self.pid = None;
    }

    pub fn url(&self) -> String {
        site_url(self.port)
    }
}

/// Every known site keyed by its canonical name.
pub type SiteMap = BTreeMap<String, SiteRecord>;

pub fn site_url(port: u16) -> String {
    format!("http://{LOCAL_HOST}:{port}")
}

/// Terminal result of one lifecycle operation: a success flag plus exactly one
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Listing entry. The name travels with the record so callers never need to
/// recover identity from a formatted label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteView {
    pub name: String,
    pub record: SiteRecord,
    pub url: String,
}

impl SiteView {
    pub fn new(name: impl Into<String>, record: SiteRecord) -> Self {
        let url = record.url();
        Self {
            name: name.into(),
            record,
            url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_pid_null() {
        let rec = SiteRecord::stopped(5000);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"port": 5000, "pid": null, "status": "Stopped", "archived": false})
        );
    }

    #[test]
    fn record_tolerates_missing_optional_fields() {
        let rec: SiteRecord = serde_json::from_str(r#"{"port": 5001, "status": "Running"}"#).unwrap();
        assert_eq!(rec.pid, None);
        assert!(!rec.archived);
        assert_eq!(rec.status, SiteStatus::Running);
    }

    #[test]
    fn mark_stopped_clears_pid() {
        let mut rec = SiteRecord::stopped(5000);
        rec.mark_running(Some(42));
        assert_eq!(rec.pid, Some(42));
        rec.mark_stopped();
        assert_eq!(rec.pid, None);
        assert_eq!(rec.status, SiteStatus::Stopped);
    }

    #[test]
    fn mark_archived_sets_both_flags() {
        let mut rec = SiteRecord::stopped(5000);
        rec.mark_archived();
        assert!(rec.archived);
        assert_eq!(rec.status, SiteStatus::Archived);
        assert!(!rec.is_active());
    }

    #[test]
    fn outcome_constructors_set_flag() {
        assert_eq!(
            Outcome::ok("done"),
            Outcome {
                success: true,
                message: "done".into()
            }
        );
        assert!(!Outcome::failed("nope").success);
    }

    #[test]
    fn view_carries_url() {
        let view = SiteView::new("blog", SiteRecord::stopped(5003));
        assert_eq!(view.url, "http://127.0.0.1:5003");
        assert_eq!(view.name, "blog");
    }
}
