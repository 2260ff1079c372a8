const MAX_MESSAGE_BYTES: usize = 8 * 1024;

/// Requests rejected by the controller before any background work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Please enter a site name.")]
    EmptyName,
    #[error("Site name cannot contain spaces.")]
    NameHasWhitespace,
    #[error("invalid site name {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidName(String),
    #[error("Site already exists: {0}")]
    AlreadyExists(String),
    #[error("site not found: {0}")]
    NotFound(String),
    #[error("site is archived: {0}")]
    Archived(String),
    #[error("site is not archived: {0}")]
    NotArchived(String),
    #[error("no free port left at or above {0}")]
    NoFreePort(u16),
    #[error("an operation is already in progress for site {0}")]
    Busy(String),
    #[error("site controller is not running")]
    ControllerGone,
}

/// Flattens an error chain into one line, dropping empty and repeated causes.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        truncate_utf8(&parts.join(": "), MAX_MESSAGE_BYTES)
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn chain_joins_causes_in_order() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write app.py")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "write app.py: disk full");
    }

    #[test]
    fn chain_skips_duplicates() {
        let err = anyhow::anyhow!("boom").context("boom");
        assert_eq!(format_error_chain(&err), "boom");
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let out = truncate_utf8(&long, MAX_MESSAGE_BYTES);
        assert!(out.len() <= MAX_MESSAGE_BYTES);
        assert!(out.ends_with("…(truncated)"));
    }

    #[test]
    fn validation_messages_are_human_readable() {
        assert_eq!(
            LifecycleError::NameHasWhitespace.to_string(),
            "Site name cannot contain spaces."
        );
        assert!(LifecycleError::Busy("blog".into()).to_string().contains("blog"));
    }
}
