use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::{directory::PortDirectory, error::ChainError, port::PortRef};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls the port directory until a port shows up.
#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    directory: PortDirectory,
    interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(directory: PortDirectory, interval: Duration) -> Self {
        Self {
            directory,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Wait until `port` is listed, or `timeout` elapses.
    ///
    /// Failed listings count as "not yet"; only running out of time is an
    /// error. The first poll happens immediately, later ones one interval
    /// apart. A listing still in flight at the deadline is abandoned.
    pub async fn wait_for_port(&self, port: &PortRef, timeout: Duration) -> Result<(), ChainError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timed_out = || ChainError::ReadinessTimeout {
            port: port.clone(),
            waited_ms: started.elapsed().as_millis(),
        };

        loop {
            ticker.tick().await;
            let Ok(listing) = tokio::time::timeout_at(deadline, self.directory.list_ports()).await else {
                debug!(%port, "port listing still pending at the deadline");
                return Err(timed_out());
            };
            match listing {
                Ok(ports) if ports.contains(port) => {
                    debug!(%port, waited_ms = started.elapsed().as_millis() as u64, "port ready");
                    return Ok(());
                }
                Ok(_) => trace!(%port, "port not there yet"),
                Err(e) => debug!(%port, error = %e, "port listing failed, will retry"),
            }
            if Instant::now() + self.interval > deadline {
                return Err(timed_out());
            }
        }
    }

    /// Wait for all `ports` concurrently; the first timeout wins.
    pub async fn wait_for_all(&self, ports: &[PortRef], timeout: Duration) -> Result<(), ChainError> {
        futures::future::try_join_all(ports.iter().map(|p| self.wait_for_port(p, timeout))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryPortDirectory;

    fn waiter(dir: &MemoryPortDirectory) -> ReadinessWaiter {
        ReadinessWaiter::new(PortDirectory(Box::new(dir.clone())), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn returns_immediately_when_port_exists() {
        let dir = MemoryPortDirectory::default();
        dir.register_port(PortRef::new("gain", "in_l"));
        let started = Instant::now();
        waiter(&dir)
            .wait_for_port(&PortRef::new("gain", "in_l"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn waits_for_a_late_port() {
        let dir = MemoryPortDirectory::default();
        dir.register_port_after(PortRef::new("reverb", "in_l"), Duration::from_millis(150));
        waiter(&dir)
            .wait_for_port(&PortRef::new("reverb", "in_l"), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ghost_port_times_out_within_the_bound() {
        let dir = MemoryPortDirectory::default();
        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        let err = waiter(&dir)
            .wait_for_port(&PortRef::new("ghost", "in_l"), timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, ChainError::ReadinessTimeout { ref port, .. } if port.to_string() == "ghost:in_l"));
        assert!(elapsed <= timeout + Duration::from_millis(150), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn slow_listing_is_cut_off_at_the_deadline() {
        let dir = MemoryPortDirectory::default();
        dir.set_list_delay(Duration::from_millis(1500));
        let w = ReadinessWaiter::new(PortDirectory(Box::new(dir.clone())), Duration::from_millis(100));
        let started = Instant::now();
        let err = w
            .wait_for_port(&PortRef::new("gain", "in_l"), Duration::from_millis(300))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, ChainError::ReadinessTimeout { .. }));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn transient_listing_failures_are_tolerated() {
        let dir = MemoryPortDirectory::default();
        dir.register_port(PortRef::new("chorus", "in_l"));
        dir.fail_next_polls(3);
        waiter(&dir)
            .wait_for_port(&PortRef::new("chorus", "in_l"), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn polls_no_faster_than_the_interval() {
        let dir = MemoryPortDirectory::default();
        let w = ReadinessWaiter::new(PortDirectory(Box::new(dir.clone())), Duration::from_millis(100));
        let _ = w
            .wait_for_port(&PortRef::new("x", "y"), Duration::from_millis(450))
            .await;
        let polls = dir.list_calls();
        assert!((4..=6).contains(&polls), "polled {polls} times");
    }
}
