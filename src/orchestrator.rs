use std::{sync::Arc, time::Duration};

use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
    chain::ChainPlan,
    config::Settings,
    directory::PortDirectory,
    error::ChainError,
    logger::StageTimer,
    port::Connection,
    process::{ProcessSupervisor, StopOutcome},
    readiness::ReadinessWaiter,
    wirer::{ConnectOutcome, GraphWirer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    Idle,
    Launching,
    WaitingReady,
    Configuring,
    Wiring,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct LaunchedProcess {
    pub name: String,
    pub pid: u32,
    /// False when a live instance was found and reused.
    pub fresh: bool,
}

/// What a successful startup did.
#[derive(Debug, Default)]
pub struct ChainReport {
    pub processes: Vec<LaunchedProcess>,
    pub connections: Vec<(Connection, ConnectOutcome)>,
    /// Commands that could not be delivered. Startup went on regardless.
    pub configure_failures: Vec<ChainError>,
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub stopped: Vec<(String, StopOutcome)>,
    pub disconnected: usize,
}

/// Drives one chain through launch, readiness, configuration and wiring,
/// and back down again.
#[derive(Debug)]
pub struct ChainOrchestrator {
    label: String,
    plan: ChainPlan,
    supervisor: Arc<ProcessSupervisor>,
    directory: PortDirectory,
    waiter: ReadinessWaiter,
    wirer: GraphWirer,
    ready_timeout: Duration,
    settle: Duration,
    state: ChainState,
    /// Pairs this orchestrator connected itself, in wiring order.
    made: Vec<Connection>,
}

impl ChainOrchestrator {
    pub fn new(
        label: impl Into<String>,
        plan: ChainPlan,
        supervisor: Arc<ProcessSupervisor>,
        directory: PortDirectory,
        settings: &Settings,
    ) -> Self {
        Self {
            label: label.into(),
            plan,
            supervisor,
            waiter: ReadinessWaiter::new(directory.clone(), settings.poll_interval),
            wirer: GraphWirer::new(directory.clone(), settings.connect_attempts, settings.connect_backoff),
            directory,
            ready_timeout: settings.ready_timeout,
            settle: settings.settle,
            state: ChainState::Idle,
            made: Vec::new(),
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn plan(&self) -> &ChainPlan {
        &self.plan
    }

    fn transition(&mut self, to: ChainState) {
        if self.state != to {
            debug!(chain = %self.label, from = %self.state, %to, "chain state");
            self.state = to;
        }
    }

    /// Bring the chain up. Any fatal error tears everything down before it
    /// is returned.
    pub async fn start(&mut self) -> Result<ChainReport, ChainError> {
        let mut report = ChainReport::default();
        match self.run_startup(&mut report).await {
            Ok(()) => {
                self.transition(ChainState::Running);
                info!(
                    chain = %self.label,
                    processes = report.processes.len(),
                    connections = report.connections.len(),
                    configure_failures = report.configure_failures.len(),
                    "chain running"
                );
                Ok(report)
            }
            Err(e) => {
                error!(chain = %self.label, state = %self.state, error = %e, "startup failed, tearing down");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn run_startup(&mut self, report: &mut ChainReport) -> Result<(), ChainError> {
        // One probe up front: a missing daemon is fatal, a failed poll later
        // on is not.
        self.directory.probe().await.map_err(|e| ChainError::ServiceUnavailable {
            reason: e.to_string(),
        })?;

        self.transition(ChainState::Launching);
        let timer = StageTimer::start(&self.label, "launching");
        let launched = self.launch_all(report);
        finish(timer, &launched);
        launched?;

        self.transition(ChainState::WaitingReady);
        let timer = StageTimer::start(&self.label, "waiting_ready");
        let ready = self
            .waiter
            .wait_for_all(&self.plan.required_ports, self.ready_timeout)
            .await;
        finish(timer, &ready);
        ready?;
        for name in self.plan.names() {
            self.supervisor.mark_running(&name);
        }

        self.transition(ChainState::Configuring);
        let timer = StageTimer::start(&self.label, "configuring");
        let sent = self.configure(report);
        timer.ok();
        if sent > 0 && !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        self.transition(ChainState::Wiring);
        let timer = StageTimer::start(&self.label, "wiring");
        let wired = self.wire(report).await;
        finish(timer, &wired);
        wired
    }

    fn launch_all(&self, report: &mut ChainReport) -> Result<(), ChainError> {
        for planned in &self.plan.processes {
            let launch = self.supervisor.launch(&planned.spec)?;
            let handle = launch.handle();
            if !launch.is_fresh() {
                info!(name = %handle.name, pid = handle.pid, "already running, reusing");
            }
            report.processes.push(LaunchedProcess {
                name: handle.name.clone(),
                pid: handle.pid,
                fresh: launch.is_fresh(),
            });
        }
        for planned in &self.plan.processes {
            if !self.supervisor.is_running(&planned.spec.name) {
                return Err(ChainError::LaunchFailed {
                    name: planned.spec.name.clone(),
                    reason: "host exited right after launch".into(),
                });
            }
        }
        Ok(())
    }

    /// Send every initial command. Returns how many were delivered.
    fn configure(&self, report: &mut ChainReport) -> usize {
        let mut sent = 0;
        for planned in &self.plan.processes {
            for command in &planned.commands {
                match self.supervisor.send(&planned.spec.name, command) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        let failure = ChainError::ConfigureFailed {
                            name: planned.spec.name.clone(),
                            command: command.to_string(),
                            reason: e.to_string(),
                        };
                        warn!(error = %failure, "skipping the remaining commands for this host");
                        report.configure_failures.push(failure);
                        break;
                    }
                }
            }
        }
        sent
    }

    async fn wire(&mut self, report: &mut ChainReport) -> Result<(), ChainError> {
        for connection in &self.plan.connections {
            let outcome = self.wirer.connect(&connection.src, &connection.dst).await?;
            if outcome == ConnectOutcome::Connected {
                self.made.push(connection.clone());
            }
            report.connections.push((connection.clone(), outcome));
        }
        Ok(())
    }

    /// Stop the chain. Safe to call in any state, including after a partial
    /// startup, and never fails because something is already gone.
    ///
    /// Only connections this orchestrator made are removed. Pairs that were
    /// already in the graph stay.
    pub async fn teardown(&mut self) -> TeardownReport {
        self.transition(ChainState::Stopping);
        let timer = StageTimer::start(&self.label, "stopping");
        let mut report = TeardownReport::default();

        let made = std::mem::take(&mut self.made);
        if !made.is_empty() {
            if self.directory.probe().await.is_ok() {
                for connection in made.iter().rev() {
                    if self.wirer.disconnect(&connection.src, &connection.dst).await {
                        report.disconnected += 1;
                    }
                }
            } else {
                debug!(chain = %self.label, "graph daemon not answering, skipping disconnects");
            }
        }

        for name in self.plan.names().iter().rev() {
            match self.supervisor.stop(name).await {
                Ok(outcome) => report.stopped.push((name.clone(), outcome)),
                Err(ChainError::NotFound { .. }) => debug!(name = %name, "not running"),
                Err(e) => warn!(name = %name, error = %e, "stop failed"),
            }
            self.supervisor.release_files(name);
        }

        timer.ok();
        info!(
            chain = %self.label,
            stopped = report.stopped.len(),
            disconnected = report.disconnected,
            "chain stopped"
        );
        self.transition(ChainState::Idle);
        report
    }

    /// Whether each declared connection currently exists.
    pub async fn connection_status(&self) -> Result<Vec<(Connection, bool)>, ChainError> {
        self.directory.probe().await.map_err(|e| ChainError::ServiceUnavailable {
            reason: e.to_string(),
        })?;
        let mut status = Vec::with_capacity(self.plan.connections.len());
        for connection in &self.plan.connections {
            let present = self
                .directory
                .list_connections(&connection.src)
                .await
                .map(|peers| peers.contains(&connection.dst))
                .unwrap_or(false);
            status.push((connection.clone(), present));
        }
        Ok(status)
    }
}

fn finish<T>(timer: StageTimer, result: &Result<T, ChainError>) {
    match result {
        Ok(_) => timer.ok(),
        Err(e) => timer.failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::ChainFile,
        directory::{MemoryPortDirectory, PortDirectoryType},
        port::PortRef,
        process::RunLayout,
    };
    use tempfile::TempDir;

    fn settings() -> Settings {
        Settings {
            ready_timeout: Duration::from_millis(800),
            poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_millis(500),
            connect_backoff: Duration::from_millis(10),
            settle: Duration::ZERO,
            ..Settings::default()
        }
    }

    fn orchestrator(tmp: &TempDir, dir: &MemoryPortDirectory, yaml: &str) -> ChainOrchestrator {
        let plan = ChainFile::from_yaml(yaml).unwrap().plan().unwrap();
        let s = settings();
        let supervisor = Arc::new(ProcessSupervisor::new(RunLayout::new(tmp.path()), s.stop_grace));
        ChainOrchestrator::new("test", plan, supervisor, PortDirectory(Box::new(dir.clone())), &s)
    }

    #[tokio::test]
    async fn configure_failures_do_not_stop_the_chain() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        dir.register_port(PortRef::new("system", "playback_1"));
        // the host is gone by the time its port shows up
        dir.register_port_after(PortRef::new("blip", "out"), Duration::from_millis(400));
        let yaml = r#"
host: { program: sh, args: ["-c", "sleep 0.1"] }
processes:
  - { name: blip, uri: "urn:blip", controls: { level: 1 } }
connections:
  - { from: "blip:out", to: "system:playback_1" }
"#;
        let mut chain = orchestrator(&tmp, &dir, yaml);
        let report = chain.start().await.unwrap();
        assert_eq!(chain.state(), ChainState::Running);
        assert_eq!(report.configure_failures.len(), 1);
        assert!(!report.configure_failures[0].is_fatal());

        chain.teardown().await;
        assert_eq!(chain.state(), ChainState::Idle);
        assert!(!tmp.path().join("blip.ctl").exists());
    }

    #[tokio::test]
    async fn wiring_failure_names_the_pair_and_tears_down() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        dir.register_port(PortRef::new("a", "out"));
        dir.register_port(PortRef::new("b", "in"));
        dir.fail_next_connects(100);
        let yaml = r#"
host: { program: sh, args: ["-c", "exec cat"] }
processes:
  - { name: a, uri: "urn:a" }
  - { name: b, uri: "urn:b" }
connections:
  - { from: "a:out", to: "b:in" }
"#;
        let mut chain = orchestrator(&tmp, &dir, yaml);
        let err = chain.start().await.unwrap_err();
        assert!(err.to_string().contains("a:out"));
        assert!(err.to_string().contains("b:in"));
        assert_eq!(chain.state(), ChainState::Idle);
        assert!(!tmp.path().join("a.ctl").exists());
        assert!(!tmp.path().join("b.ctl").exists());
    }

    #[tokio::test]
    async fn teardown_disconnects_declared_pairs_only() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        for p in ["a:out", "b:in", "system:capture_1"] {
            dir.register_port(p.parse().unwrap());
        }
        dir.connect(&"system:capture_1".parse().unwrap(), &"b:in".parse().unwrap())
            .await
            .unwrap();
        let yaml = r#"
host: { program: sh, args: ["-c", "exec cat"] }
processes:
  - { name: a, uri: "urn:a" }
  - { name: b, uri: "urn:b" }
connections:
  - { from: "a:out", to: "b:in" }
"#;
        let mut chain = orchestrator(&tmp, &dir, yaml);
        chain.start().await.unwrap();
        assert_eq!(dir.connection_count(), 2);

        let report = chain.teardown().await;
        assert_eq!(report.disconnected, 1);
        assert_eq!(report.stopped.len(), 2);
        assert_eq!(dir.connection_count(), 1);
    }

    #[tokio::test]
    async fn existing_routes_survive_a_failed_start() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        let capture: PortRef = "system:capture_1".parse().unwrap();
        let playback: PortRef = "system:playback_1".parse().unwrap();
        dir.register_port(capture.clone());
        dir.register_port(playback.clone());
        dir.connect(&capture, &playback).await.unwrap();
        let yaml = r#"
host: { program: /nonexistent/host }
processes:
  - { name: a, uri: "urn:a" }
connections:
  - { from: "system:capture_1", to: "system:playback_1" }
"#;
        let mut chain = orchestrator(&tmp, &dir, yaml);
        let err = chain.start().await.unwrap_err();
        assert!(matches!(err, ChainError::LaunchFailed { .. }));
        assert_eq!(dir.connection_count(), 1);
    }

    #[tokio::test]
    async fn teardown_keeps_pairs_that_were_already_connected() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        for p in ["a:out", "b:in", "system:capture_1"] {
            dir.register_port(p.parse().unwrap());
        }
        dir.connect(&"system:capture_1".parse().unwrap(), &"a:out".parse().unwrap())
            .await
            .unwrap();
        let yaml = r#"
host: { program: sh, args: ["-c", "exec cat"] }
processes:
  - { name: a, uri: "urn:a" }
  - { name: b, uri: "urn:b" }
connections:
  - { from: "system:capture_1", to: "a:out" }
  - { from: "a:out", to: "b:in" }
"#;
        let mut chain = orchestrator(&tmp, &dir, yaml);
        let report = chain.start().await.unwrap();
        assert_eq!(report.connections[0].1, ConnectOutcome::AlreadyConnected);
        assert_eq!(report.connections[1].1, ConnectOutcome::Connected);

        let torn = chain.teardown().await;
        assert_eq!(torn.disconnected, 1);
        assert_eq!(dir.connection_count(), 1);
    }

    #[tokio::test]
    async fn connection_status_reflects_the_graph() {
        let tmp = TempDir::new().unwrap();
        let dir = MemoryPortDirectory::default();
        dir.register_port("a:out".parse().unwrap());
        dir.register_port("b:in".parse().unwrap());
        let yaml = r#"
host: { program: sh, args: ["-c", "exec cat"] }
processes:
  - { name: a, uri: "urn:a" }
connections:
  - { from: "a:out", to: "b:in" }
"#;
        let chain = orchestrator(&tmp, &dir, yaml);
        let status = chain.connection_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(!status[0].1);

        dir.set_offline(true);
        assert!(matches!(
            chain.connection_status().await,
            Err(ChainError::ServiceUnavailable { .. })
        ));
    }
}
