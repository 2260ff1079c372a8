use std::collections::{BTreeSet, HashSet};

use sitedock_site::SiteMap;

/// Ports currently reserved by active (non-archived) records.
pub fn used_ports(sites: &SiteMap) -> BTreeSet<u16> {
    sites
        .values()
        .filter(|r| r.is_active())
        .map(|r| r.port)
        .collect()
}

/// Smallest port >= `base` not held by an active record, or `None` once every
/// port from `base` up is taken.
///
/// Re-scans from `base` on every call so gaps left by archived or deleted
/// sites are reused.
pub fn next_free_port(sites: &SiteMap, base: u16) -> Option<u16> {
    next_free_port_excluding(sites, base, &HashSet::new())
}

/// Like [`next_free_port`], additionally skipping ports promised to in-flight
/// create/restore operations.
pub fn next_free_port_excluding(
    sites: &SiteMap,
    base: u16,
    reserved: &HashSet<u16>,
) -> Option<u16> {
    let used = used_ports(sites);
    (base..=u16::MAX).find(|p| !used.contains(p) && !reserved.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedock_site::SiteRecord;

    fn map(entries: &[(&str, u16, bool)]) -> SiteMap {
        entries
            .iter()
            .map(|(name, port, archived)| {
                let mut rec = SiteRecord::stopped(*port);
                if *archived {
                    rec.mark_archived();
                }
                (name.to_string(), rec)
            })
            .collect()
    }

    #[test]
    fn empty_map_starts_at_base() {
        assert_eq!(next_free_port(&SiteMap::new(), 5000), Some(5000));
    }

    #[test]
    fn skips_active_port() {
        assert_eq!(next_free_port(&map(&[("a", 5000, false)]), 5000), Some(5001));
    }

    #[test]
    fn archived_port_is_reused() {
        assert_eq!(next_free_port(&map(&[("a", 5000, true)]), 5000), Some(5000));
    }

    #[test]
    fn fills_lowest_gap() {
        let sites = map(&[("a", 5000, false), ("b", 5002, false), ("c", 5001, true)]);
        assert_eq!(next_free_port(&sites, 5000), Some(5001));
    }

    #[test]
    fn result_is_minimal_and_unused() {
        let sites = map(&[
            ("a", 5000, false),
            ("b", 5001, false),
            ("c", 5003, false),
            ("d", 5004, true),
        ]);
        let used = used_ports(&sites);
        let port = next_free_port(&sites, 5000).unwrap();
        assert!(!used.contains(&port));
        assert!((5000..port).all(|p| used.contains(&p)));
        assert_eq!(port, 5002);
    }

    #[test]
    fn exhausted_port_space_yields_none() {
        let sites = map(&[("a", u16::MAX - 1, false), ("b", u16::MAX, false)]);
        assert_eq!(next_free_port(&sites, u16::MAX - 1), None);

        let reserved: HashSet<u16> = [u16::MAX].into_iter().collect();
        let sites = map(&[("a", u16::MAX - 1, false)]);
        assert_eq!(next_free_port_excluding(&sites, u16::MAX - 1, &reserved), None);
    }

    #[test]
    fn reserved_ports_are_skipped() {
        let sites = map(&[("a", 5000, false)]);
        let reserved: HashSet<u16> = [5001].into_iter().collect();
        assert_eq!(next_free_port_excluding(&sites, 5000, &reserved), Some(5002));
    }
}
