use std::{collections::HashMap, time::Duration};

use sitedock_site::LOCAL_HOST;
use tokio::time::Instant;

/// Per-port probe results with a short time-to-live.
#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    entries: HashMap<u16, (bool, Instant)>,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, port: u16) -> Option<bool> {
        let (in_use, at) = self.entries.get(&port)?;
        if at.elapsed() < self.ttl {
            Some(*in_use)
        } else {
            None
        }
    }

    pub fn put(&mut self, port: u16, in_use: bool) {
        self.entries.insert(port, (in_use, Instant::now()));
    }

    pub fn invalidate(&mut self, port: u16) {
        self.entries.remove(&port);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Single TCP connect attempt against loopback. Timeouts and socket errors
/// both read as "not in use".
pub async fn probe_port(port: u16, timeout: Duration) -> Option<bool> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((LOCAL_HOST, port))).await {
        Ok(Ok(s)) => {
            drop(s);
            Some(true)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Some(false),
        Ok(Err(e)) => {
            tracing::debug!(port, error = %e, "port probe failed");
            None
        }
        Err(_) => {
            tracing::debug!(port, "port probe timed out");
            None
        }
    }
}

/// Cached port probe owned by the controller.
#[derive(Debug)]
pub struct PortProbe {
    cache: ProbeCache,
    timeout: Duration,
}

impl PortProbe {
    pub fn new(timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            cache: ProbeCache::new(cache_ttl),
            timeout,
        }
    }

    /// Call after any state-changing action so the next read is fresh.
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
    }

    pub async fn in_use(&mut self, port: u16) -> bool {
        if let Some(hit) = self.cache.get(port) {
            return hit;
        }
        match probe_port(port, self.timeout).await {
            Some(v) => {
                self.cache.put(port, v);
                v
            }
            None => false,
        }
    }

    /// Probes several ports concurrently, serving what it can from the cache.
    pub async fn in_use_many(&mut self, ports: &[u16]) -> HashMap<u16, bool> {
        let mut out = HashMap::with_capacity(ports.len());
        let mut misses = Vec::new();
        for &port in ports {
            match self.cache.get(port) {
                Some(hit) => {
                    out.insert(port, hit);
                }
                None => {
                    if !misses.contains(&port) {
                        misses.push(port);
                    }
                }
            }
        }

        let timeout = self.timeout;
        let results = futures_util::future::join_all(
            misses
                .iter()
                .map(|&port| async move { (port, probe_port(port, timeout).await) }),
        )
        .await;

        for (port, res) in results {
            if let Some(v) = res {
                self.cache.put(port, v);
            }
            out.insert(port, res.unwrap_or(false));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind((LOCAL_HOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn listening_port_is_in_use() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut probe = PortProbe::new(Duration::from_secs(1), Duration::from_secs(2));
        assert!(probe.in_use(port).await);
    }

    #[tokio::test]
    async fn closed_port_is_not_in_use() {
        let port = free_port();
        let mut probe = PortProbe::new(Duration::from_secs(1), Duration::from_secs(2));
        assert!(!probe.in_use(port).await);
    }

    #[tokio::test]
    async fn cached_result_survives_until_invalidated() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut probe = PortProbe::new(Duration::from_secs(1), Duration::from_secs(60));
        assert!(probe.in_use(port).await);

        drop(listener);
        assert!(probe.in_use(port).await, "served from cache");

        probe.invalidate_all();
        assert!(!probe.in_use(port).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_ttl() {
        let mut cache = ProbeCache::new(Duration::from_secs(2));
        cache.put(5000, true);
        assert_eq!(cache.get(5000), Some(true));

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(cache.get(5000), Some(true));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get(5000), None);
    }

    #[test]
    fn invalidate_removes_single_port() {
        let mut cache = ProbeCache::new(Duration::from_secs(60));
        cache.put(5000, true);
        cache.put(5001, false);
        cache.invalidate(5000);
        assert_eq!(cache.get(5000), None);
        assert_eq!(cache.get(5001), Some(false));
    }

    #[tokio::test]
    async fn many_mixes_open_and_closed_ports() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = free_port();
        let mut probe = PortProbe::new(Duration::from_secs(1), Duration::from_secs(2));
        let res = probe.in_use_many(&[open, closed, open]).await;
        assert_eq!(res.get(&open), Some(&true));
        assert_eq!(res.get(&closed), Some(&false));
    }
}
