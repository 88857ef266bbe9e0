//! Random port allocation with availability probing

use async_trait::async_trait;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

/// IANA dynamic/private port range
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Answers whether a local TCP port can be bound right now
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_available(&self, port: u16) -> bool;
}

/// Binds `127.0.0.1:port` and releases it immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_available(&self, port: u16) -> bool {
        tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .is_ok()
    }
}

/// Picks random candidate ports and checks them with a [`PortProbe`]
#[derive(Clone)]
pub struct PortAllocator {
    probe: Arc<dyn PortProbe>,
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    pub fn new(probe: Arc<dyn PortProbe>) -> Self {
        Self {
            probe,
            range: EPHEMERAL_PORTS,
        }
    }

    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.range = range;
        self
    }

    pub async fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(port).await
    }

    /// Return the first free candidate within `max_tries` probes.
    ///
    /// When none is free the last candidate is returned anyway; the caller's
    /// bind fails later and is retried by the launch pipeline.
    pub async fn allocate(&self, max_tries: u32) -> u16 {
        let tries = max_tries.max(1);
        let mut candidate = 0;
        for _ in 0..tries {
            candidate = self.candidate();
            log::info!("Generated random port {}", candidate);

            if self.probe.is_available(candidate).await {
                log::info!("Port {} is available", candidate);
                return candidate;
            }
        }

        log::warn!(
            "No free port found in {} tries, falling back to {}",
            tries,
            candidate
        );
        candidate
    }

    /// Poll until `port` is free, up to `wait.retries` probes spaced by
    /// `wait.interval`. Returns whether the port was seen free.
    pub async fn wait_until_released(&self, port: u16, wait: ReleaseWait) -> bool {
        for remaining in (1..=wait.retries).rev() {
            if self.probe.is_available(port).await {
                log::info!("Port {} is available again", port);
                return true;
            }
            log::info!(
                "Waiting until port {} is cleared by the worker ({} retries left)...",
                port,
                remaining
            );
            tokio::time::sleep(wait.interval).await;
        }

        log::warn!("Port {} still busy after {} checks, continuing", port, wait.retries);
        false
    }

    fn candidate(&self) -> u16 {
        rand::thread_rng().gen_range(self.range.clone())
    }
}

/// Bounded wait for a port to be released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseWait {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for ReleaseWait {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted answers, then repeats the last one
    struct Scripted {
        answers: Mutex<VecDeque<bool>>,
        last: bool,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(answers: &[bool], last: bool) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                last,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PortProbe for Scripted {
        async fn is_available(&self, _port: u16) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().pop_front().unwrap_or(self.last)
        }
    }

    #[tokio::test]
    async fn test_allocate_returns_first_free_candidate() {
        let probe = Arc::new(Scripted::new(&[false, false], true));
        let allocator = PortAllocator::new(probe.clone());

        let port = allocator.allocate(10).await;
        assert!(EPHEMERAL_PORTS.contains(&port));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_allocate_degrades_to_last_candidate() {
        let probe = Arc::new(Scripted::new(&[], false));
        let allocator = PortAllocator::new(probe.clone()).with_range(50000..=50000);

        let port = allocator.allocate(4).await;
        assert_eq!(port, 50000);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_allocate_probes_at_least_once() {
        let probe = Arc::new(Scripted::new(&[], true));
        let allocator = PortAllocator::new(probe.clone());
        allocator.allocate(0).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tcp_probe_sees_bound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!TcpPortProbe.is_available(port).await);
        drop(listener);
        assert!(TcpPortProbe.is_available(port).await);
        // Probing does not hold the port
        assert!(TcpPortProbe.is_available(port).await);
    }

    #[tokio::test]
    async fn test_wait_until_released_is_bounded() {
        let probe = Arc::new(Scripted::new(&[], false));
        let allocator = PortAllocator::new(probe.clone());
        let wait = ReleaseWait {
            retries: 3,
            interval: Duration::from_millis(1),
        };

        assert!(!allocator.wait_until_released(1234, wait).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_released_stops_when_free() {
        let probe = Arc::new(Scripted::new(&[false], true));
        let allocator = PortAllocator::new(probe.clone());
        let wait = ReleaseWait {
            retries: 10,
            interval: Duration::from_millis(1),
        };

        assert!(allocator.wait_until_released(1234, wait).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
