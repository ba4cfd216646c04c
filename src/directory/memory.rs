use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::{error::DirectoryError, port::PortRef};

use super::PortDirectoryType;

/// In-process stand-in for the graph daemon.
///
/// Clones share state, so a test can keep one handle to register ports and
/// inspect connections while the orchestrator drives another. Failures can
/// be injected to exercise the retry paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryPortDirectory {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ports: DashSet<PortRef>,
    edges: DashMap<PortRef, BTreeSet<PortRef>>,
    offline: AtomicBool,
    failing_polls: AtomicU32,
    failing_connects: AtomicU32,
    connect_calls: AtomicU32,
    list_calls: AtomicU32,
    list_delay_ms: AtomicU64,
}

impl MemoryPortDirectory {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn register_port(&self, port: PortRef) {
        self.inner.ports.insert(port);
    }

    /// Register `port` after `delay`, the way a host exposes ports some time
    /// after it was spawned.
    pub fn register_port_after(&self, port: PortRef, delay: Duration) {
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.register_port(port);
        });
    }

    /// Drop a port together with every connection touching it.
    pub fn unregister_port(&self, port: &PortRef) {
        self.inner.ports.remove(port);
        if let Some((_, peers)) = self.inner.edges.remove(port) {
            for peer in peers {
                if let Some(mut back) = self.inner.edges.get_mut(&peer) {
                    back.remove(port);
                }
            }
        }
    }

    /// Drop every port owned by `component`.
    pub fn unregister_component(&self, component: &str) {
        let owned: Vec<PortRef> = self
            .inner
            .ports
            .iter()
            .filter(|p| p.component == component)
            .map(|p| p.key().clone())
            .collect();
        for port in owned {
            self.unregister_port(&port);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` port listings fail as if the daemon were busy.
    pub fn fail_next_polls(&self, n: u32) {
        self.inner.failing_polls.store(n, Ordering::SeqCst);
    }

    /// The next `n` connect requests fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Every port listing takes `delay` before it answers.
    pub fn set_list_delay(&self, delay: Duration) {
        self.inner
            .list_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u32 {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct connections, counting each pair once.
    pub fn connection_count(&self) -> usize {
        let total: usize = self.inner.edges.iter().map(|e| e.value().len()).sum();
        total / 2
    }

    fn check_online(&self) -> Result<(), DirectoryError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("graph daemon is not running".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PortDirectoryType for MemoryPortDirectory {
    async fn list_ports(&self) -> Result<BTreeSet<PortRef>, DirectoryError> {
        self.check_online()?;
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if Self::take_failure(&self.inner.failing_polls) {
            return Err(DirectoryError::Unavailable("graph daemon busy".into()));
        }
        Ok(self.inner.ports.iter().map(|p| p.key().clone()).collect())
    }

    async fn list_connections(&self, port: &PortRef) -> Result<BTreeSet<PortRef>, DirectoryError> {
        self.check_online()?;
        Ok(self
            .inner
            .edges
            .get(port)
            .map(|peers| peers.value().clone())
            .unwrap_or_default())
    }

    async fn connect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        self.check_online()?;
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.inner.failing_connects) {
            return Err(DirectoryError::Failed(format!("cannot connect {src} to {dst}")));
        }
        for port in [src, dst] {
            if !self.inner.ports.contains(port) {
                return Err(DirectoryError::Failed(format!("port `{port}` not found")));
            }
        }
        let fresh = self.inner.edges.entry(src.clone()).or_default().insert(dst.clone());
        if !fresh {
            return Err(DirectoryError::Failed(format!("{src} and {dst} already connected")));
        }
        self.inner.edges.entry(dst.clone()).or_default().insert(src.clone());
        Ok(())
    }

    async fn disconnect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        self.check_online()?;
        let removed = self
            .inner
            .edges
            .get_mut(src)
            .map(|mut peers| peers.remove(dst))
            .unwrap_or(false);
        if !removed {
            return Err(DirectoryError::Failed(format!("{src} and {dst} not connected")));
        }
        if let Some(mut back) = self.inner.edges.get_mut(dst) {
            back.remove(src);
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn PortDirectoryType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!(
            "MemoryPortDirectory({} ports, {} connections)",
            self.inner.ports.len(),
            self.connection_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PortRef {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn connections_are_visible_from_both_ends() {
        let dir = MemoryPortDirectory::new();
        dir.register_port(p("sampler:out_l"));
        dir.register_port(p("chorus:in_l"));

        dir.connect(&p("sampler:out_l"), &p("chorus:in_l")).await.unwrap();
        assert!(dir.list_connections(&p("sampler:out_l")).await.unwrap().contains(&p("chorus:in_l")));
        assert!(dir.list_connections(&p("chorus:in_l")).await.unwrap().contains(&p("sampler:out_l")));
        assert_eq!(dir.connection_count(), 1);

        // duplicates are refused like the real daemon does
        assert!(dir.connect(&p("sampler:out_l"), &p("chorus:in_l")).await.is_err());

        dir.disconnect(&p("sampler:out_l"), &p("chorus:in_l")).await.unwrap();
        assert_eq!(dir.connection_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let dir = MemoryPortDirectory::new();
        dir.register_port(p("gain:in_l"));
        dir.fail_next_polls(2);
        assert!(dir.list_ports().await.is_err());
        assert!(dir.list_ports().await.is_err());
        assert!(dir.list_ports().await.unwrap().contains(&p("gain:in_l")));
    }

    #[tokio::test]
    async fn removing_a_component_drops_its_connections() {
        let dir = MemoryPortDirectory::new();
        dir.register_port(p("reverb:out_l"));
        dir.register_port(p("gain:in_l"));
        dir.connect(&p("reverb:out_l"), &p("gain:in_l")).await.unwrap();

        dir.unregister_component("reverb");
        assert!(dir.list_connections(&p("gain:in_l")).await.unwrap().is_empty());
        assert!(!dir.list_ports().await.unwrap().contains(&p("reverb:out_l")));
    }

    #[tokio::test]
    async fn offline_daemon_is_unavailable() {
        let dir = MemoryPortDirectory::new();
        dir.set_offline(true);
        assert!(matches!(dir.probe().await, Err(DirectoryError::Unavailable(_))));
    }
}
