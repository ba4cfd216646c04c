use std::{path::Path, sync::Arc, time::Duration};

use chainrig::{
    ChainError,
    chain::ChainFile,
    command::HostCommand,
    config::Settings,
    directory::{MemoryPortDirectory, PortDirectory, PortDirectoryType},
    orchestrator::{ChainOrchestrator, ChainState},
    port::PortRef,
    process::{ProcessSupervisor, RunLayout},
    wirer::ConnectOutcome,
};
use tempfile::TempDir;

const TWO_HOSTS: &str = r#"
host: { program: sh, args: ["-c", "echo $$; exec cat"] }
processes:
  - { name: A, uri: "urn:test:a" }
  - { name: B, uri: "urn:test:b", controls: { gain: 0.5 } }
connections:
  - { from: "A:out", to: "B:in" }
"#;

fn settings(run_dir: &Path) -> Settings {
    Settings {
        run_dir: run_dir.to_path_buf(),
        ready_timeout: Duration::from_millis(1500),
        poll_interval: Duration::from_millis(25),
        stop_grace: Duration::from_millis(1000),
        connect_backoff: Duration::from_millis(10),
        settle: Duration::from_millis(10),
        ..Settings::default()
    }
}

fn orchestrator(tmp: &TempDir, dir: &MemoryPortDirectory, yaml: &str) -> (ChainOrchestrator, Arc<ProcessSupervisor>) {
    let settings = settings(tmp.path());
    let plan = ChainFile::from_yaml(yaml).unwrap().plan().unwrap();
    let supervisor = Arc::new(ProcessSupervisor::new(
        RunLayout::new(&settings.run_dir),
        settings.stop_grace,
    ));
    let orchestrator = ChainOrchestrator::new(
        "it",
        plan,
        supervisor.clone(),
        PortDirectory(Box::new(dir.clone())),
        &settings,
    );
    (orchestrator, supervisor)
}

fn control_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".ctl"))
                .collect()
        })
        .unwrap_or_default()
}

/// Live processes whose command line mentions `marker`.
fn processes_mentioning(marker: &str) -> usize {
    std::fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|e| std::fs::read(e.path().join("cmdline")).ok())
        .filter(|cmdline| String::from_utf8_lossy(cmdline).contains(marker))
        .count()
}

fn port(s: &str) -> PortRef {
    s.parse().unwrap()
}

#[tokio::test]
async fn two_hosts_end_up_wired_and_running() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    dir.register_port_after(port("A:out"), Duration::from_millis(100));
    dir.register_port_after(port("B:in"), Duration::from_millis(200));

    let (mut chain, supervisor) = orchestrator(&tmp, &dir, TWO_HOSTS);
    let report = chain.start().await.unwrap();

    assert_eq!(chain.state(), ChainState::Running);
    assert_eq!(report.processes.len(), 2);
    assert!(report.configure_failures.is_empty());
    assert_eq!(report.connections[0].1, ConnectOutcome::Connected);

    let peers = dir.list_connections(&port("A:out")).await.unwrap();
    assert_eq!(peers.into_iter().collect::<Vec<_>>(), vec![port("B:in")]);
    assert!(supervisor.is_running("A"));
    assert!(supervisor.is_running("B"));

    // the initial parameter went through B's control pipe
    let log = supervisor.handle("B").unwrap().log;
    let mut seen = String::new();
    for _ in 0..50 {
        seen = std::fs::read_to_string(&log).unwrap_or_default();
        if seen.contains("set gain 0.5") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen.contains("set gain 0.5"), "log was {seen:?}");

    chain.teardown().await;
    assert_eq!(chain.state(), ChainState::Idle);
    assert!(control_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn starting_twice_reuses_everything() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    dir.register_port(port("A:out"));
    dir.register_port(port("B:in"));

    let (mut first, _) = orchestrator(&tmp, &dir, TWO_HOSTS);
    let first_report = first.start().await.unwrap();

    // a separate invocation over the same run directory
    let (mut second, supervisor) = orchestrator(&tmp, &dir, TWO_HOSTS);
    let second_report = second.start().await.unwrap();

    assert_eq!(second.state(), ChainState::Running);
    assert!(second_report.processes.iter().all(|p| !p.fresh));
    let pids = |r: &chainrig::orchestrator::ChainReport| r.processes.iter().map(|p| p.pid).collect::<Vec<_>>();
    assert_eq!(pids(&first_report), pids(&second_report));
    assert_eq!(second_report.connections[0].1, ConnectOutcome::AlreadyConnected);
    assert_eq!(dir.connection_count(), 1);
    assert_eq!(supervisor.names().len(), 2);

    second.teardown().await;
    assert!(supervisor.names().is_empty());
    assert!(control_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn ghost_port_times_out_and_leaves_nothing_behind() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    dir.register_port(port("A:out"));
    let yaml = r#"
host: { program: sh, args: ["-c", "exec cat"] }
processes:
  - { name: A, uri: "urn:test:a" }
connections:
  - { from: "A:out", to: "ghost:in_l" }
"#;
    let (mut chain, supervisor) = orchestrator(&tmp, &dir, yaml);
    let started = std::time::Instant::now();
    let err = chain.start().await.unwrap_err();

    match err {
        ChainError::ReadinessTimeout { port: p, .. } => assert_eq!(p, port("ghost:in_l")),
        other => panic!("unexpected {other}"),
    }
    assert!(started.elapsed() < Duration::from_millis(1500 + 1500));
    assert_eq!(chain.state(), ChainState::Idle);
    assert!(supervisor.names().is_empty());
    assert!(control_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn partial_start_stops_exactly_the_launched_hosts() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    // `{log}` lands in $0, so every host's command line names the run dir
    let yaml = r#"
host: { program: sh, args: ["-c", "while :; do sleep 0.05; done", "{log}"] }
processes:
  - { name: sampler, uri: "urn:test:sampler" }
  - { name: chorus, uri: "urn:test:chorus" }
  - { name: reverb, uri: "urn:test:reverb", host: { program: /nonexistent/host } }
  - { name: gain, uri: "urn:test:gain" }
"#;
    let (mut chain, supervisor) = orchestrator(&tmp, &dir, yaml);
    let layout = RunLayout::new(tmp.path());
    let marker = tmp.path().to_string_lossy().into_owned();

    let err = chain.start().await.unwrap_err();
    assert!(matches!(err, ChainError::LaunchFailed { ref name, .. } if name == "reverb"));

    assert!(layout.log("sampler").exists());
    assert!(layout.log("chorus").exists());
    assert!(!layout.log("gain").exists());
    assert_eq!(processes_mentioning(&marker), 0);
    assert!(supervisor.names().is_empty());
    assert!(control_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn send_after_stop_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    dir.register_port(port("A:out"));
    dir.register_port(port("B:in"));

    let (mut chain, supervisor) = orchestrator(&tmp, &dir, TWO_HOSTS);
    chain.start().await.unwrap();
    supervisor.send("A", &HostCommand::DumpState).unwrap();

    supervisor.stop("A").await.unwrap();
    let started = std::time::Instant::now();
    let err = supervisor.send("A", &HostCommand::DumpState).unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(matches!(err, ChainError::ChannelUnavailable { .. }));

    // teardown copes with A being gone already
    let report = chain.teardown().await;
    assert_eq!(report.stopped.len(), 1);
    assert!(control_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn missing_daemon_is_reported_before_anything_launches() {
    let tmp = TempDir::new().unwrap();
    let dir = MemoryPortDirectory::default();
    dir.set_offline(true);

    let (mut chain, supervisor) = orchestrator(&tmp, &dir, TWO_HOSTS);
    let err = chain.start().await.unwrap_err();

    assert!(matches!(err, ChainError::ServiceUnavailable { .. }));
    assert!(supervisor.names().is_empty());
    assert!(!RunLayout::new(tmp.path()).log("A").exists());
}
