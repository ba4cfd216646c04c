use std::{
    fs::OpenOptions,
    io,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{
    channel::ControlChannel,
    command::HostCommand,
    error::ChainError,
};

use super::{
    record::{ProcessRecord, RunLayout, remove_quietly},
    spec::ProcessSpec,
};

/// How long to wait for a process to vanish after the forceful signal.
const KILL_WAIT: Duration = Duration::from_secs(1);
const ADOPTED_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Runtime state of one launched host. Owned by the supervisor.
#[derive(Debug)]
struct ManagedProcess {
    name: String,
    uri: String,
    pid: u32,
    channel: Arc<ControlChannel>,
    log: PathBuf,
    state: LifecycleState,
    started_at: DateTime<Utc>,
    adopted: bool,
    /// `None` for adopted processes, and while a stop owns the child.
    child: Option<Child>,
}

impl ManagedProcess {
    fn is_alive(&mut self) -> bool {
        let alive = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => pid_alive(self.pid),
        };
        if !alive && self.state != LifecycleState::Stopping {
            self.state = LifecycleState::Stopped;
        }
        alive
    }

    fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            name: self.name.clone(),
            uri: self.uri.clone(),
            pid: self.pid,
            channel: self.channel.clone(),
            log: self.log.clone(),
            state: self.state,
            started_at: self.started_at,
            adopted: self.adopted,
        }
    }
}

async fn wait_gone(pid: u32, child: Option<&mut Child>, within: Duration) -> bool {
    if let Some(child) = child {
        return tokio::time::timeout(within, child.wait()).await.is_ok();
    }
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(ADOPTED_POLL).await;
    }
}

/// A snapshot of a managed process handed out to callers.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub name: String,
    pub uri: String,
    pub pid: u32,
    pub channel: Arc<ControlChannel>,
    pub log: PathBuf,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub adopted: bool,
}

#[derive(Debug, Clone)]
pub enum Launch {
    Started(ProcessHandle),
    /// A live instance already existed; nothing was spawned.
    AlreadyRunning(ProcessHandle),
}

impl Launch {
    pub fn handle(&self) -> &ProcessHandle {
        match self {
            Launch::Started(h) | Launch::AlreadyRunning(h) => h,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Launch::Started(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopOutcome {
    /// The process was already gone.
    AlreadyExited,
    /// Exited within the grace period after the termination signal.
    Graceful,
    /// Needed the kill signal.
    Killed,
    /// Still present after the kill signal; resources were released anyway.
    Unresponsive,
}

/// Starts, tracks and stops host processes by logical name.
///
/// The registry is the only source of truth for what is running. On
/// construction it is seeded from the process records found in the run
/// directory, so separate invocations see each other's hosts.
#[derive(Debug)]
pub struct ProcessSupervisor {
    layout: RunLayout,
    grace: Duration,
    processes: DashMap<String, ManagedProcess>,
}

impl ProcessSupervisor {
    pub fn new(layout: RunLayout, grace: Duration) -> Self {
        let me = Self {
            layout,
            grace,
            processes: DashMap::new(),
        };
        me.adopt_existing();
        me
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    fn adopt_existing(&self) {
        for record in self.layout.read_records() {
            if self.processes.contains_key(&record.name) {
                continue;
            }
            let channel_path = self.layout.channel(&record.name);
            if !pid_alive(record.pid) {
                debug!(name = %record.name, pid = record.pid, "removing stale process record");
                self.layout.remove_record(&record.name);
                remove_quietly(&channel_path);
                continue;
            }
            let channel = ControlChannel::attach(&record.name, &channel_path).unwrap_or_else(|e| {
                warn!(name = %record.name, error = %e, "adopted process has no usable control channel");
                ControlChannel::detached(&record.name, &channel_path)
            });
            info!(name = %record.name, pid = record.pid, "adopted running host");
            self.processes.insert(
                record.name.clone(),
                ManagedProcess {
                    log: self.layout.log(&record.name),
                    name: record.name,
                    uri: record.uri,
                    pid: record.pid,
                    channel,
                    state: LifecycleState::Running,
                    started_at: record.started_at,
                    adopted: true,
                    child: None,
                },
            );
        }
    }

    /// Start `spec` unless a live process with the same name already exists.
    pub fn launch(&self, spec: &ProcessSpec) -> Result<Launch, ChainError> {
        match self.processes.entry(spec.name.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state == LifecycleState::Stopping {
                    return Err(ChainError::LaunchFailed {
                        name: spec.name.clone(),
                        reason: "previous instance is still stopping".into(),
                    });
                }
                if occupied.get_mut().is_alive() {
                    debug!(name = %spec.name, pid = occupied.get().pid, "already running");
                    return Ok(Launch::AlreadyRunning(occupied.get().handle()));
                }
                warn!(name = %spec.name, "previous instance exited, relaunching");
                if let Err(e) = occupied.get().channel.close() {
                    warn!(name = %spec.name, error = %e, "could not remove old control channel");
                }
                match self.spawn(spec) {
                    Ok(process) => {
                        let handle = process.handle();
                        occupied.insert(process);
                        Ok(Launch::Started(handle))
                    }
                    Err(e) => {
                        occupied.remove();
                        self.layout.remove_record(&spec.name);
                        Err(e)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let process = self.spawn(spec)?;
                let handle = process.handle();
                vacant.insert(process);
                Ok(Launch::Started(handle))
            }
        }
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<ManagedProcess, ChainError> {
        let failed = |reason: String| ChainError::LaunchFailed {
            name: spec.name.clone(),
            reason,
        };
        self.layout.ensure().map_err(|e| failed(e.to_string()))?;

        let channel_path = self.layout.channel(&spec.name);
        let log_path = self.layout.log(&spec.name);

        // The pipe exists before the host does.
        let channel = ControlChannel::create(&spec.name, &channel_path).map_err(|e| failed(e.to_string()))?;

        let child = match self.spawn_host(spec, &channel, &log_path) {
            Ok(child) => child,
            Err(e) => {
                let _ = channel.close();
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            let _ = channel.close();
            return Err(failed("host exited before its pid could be read".into()));
        };

        let started_at = Utc::now();
        let record = ProcessRecord {
            name: spec.name.clone(),
            pid,
            uri: spec.uri.clone(),
            started_at,
        };
        if let Err(e) = self.layout.write_record(&record) {
            warn!(name = %spec.name, error = %e, "could not persist process record");
        }

        info!(
            name = %spec.name,
            pid,
            uri = %spec.uri,
            log = %log_path.display(),
            "host launched"
        );
        Ok(ManagedProcess {
            name: spec.name.clone(),
            uri: spec.uri.clone(),
            pid,
            channel,
            log: log_path,
            state: LifecycleState::Starting,
            started_at,
            adopted: false,
            child: Some(child),
        })
    }

    fn spawn_host(
        &self,
        spec: &ProcessSpec,
        channel: &ControlChannel,
        log_path: &std::path::Path,
    ) -> Result<Child, ChainError> {
        let failed = |reason: String| ChainError::LaunchFailed {
            name: spec.name.clone(),
            reason,
        };
        let stdin = channel.host_end().map_err(|e| failed(e.to_string()))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| failed(format!("{}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| failed(format!("{}: {e}", log_path.display())))?;

        let args = spec.host.render_args(spec, channel.path(), log_path);
        debug!(name = %spec.name, program = %spec.host.program, ?args, "spawning host");

        let mut cmd = Command::new(&spec.host.program);
        cmd.args(&args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // own process group: signals reach helper children, and a Ctrl-C
            // in the launching terminal does not
            .process_group(0)
            .kill_on_drop(false);

        cmd.spawn()
            .map_err(|e| failed(format!("cannot run `{}`: {e}", spec.host.program)))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.processes
            .get_mut(name)
            .map(|mut p| p.is_alive())
            .unwrap_or(false)
    }

    /// Promote a `starting` process to `running` once its ports are up.
    pub fn mark_running(&self, name: &str) {
        if let Some(mut p) = self.processes.get_mut(name) {
            if p.state == LifecycleState::Starting {
                p.state = LifecycleState::Running;
            }
        }
    }

    pub fn handle(&self, name: &str) -> Option<ProcessHandle> {
        self.processes.get_mut(name).map(|mut p| {
            p.is_alive();
            p.handle()
        })
    }

    /// Every managed process, oldest first.
    pub fn list(&self) -> Vec<ProcessHandle> {
        let mut all: Vec<ProcessHandle> = self
            .processes
            .iter_mut()
            .map(|mut p| {
                p.is_alive();
                p.handle()
            })
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|h| h.name).collect()
    }

    pub fn channel(&self, name: &str) -> Result<Arc<ControlChannel>, ChainError> {
        let handle = self.handle(name).ok_or_else(|| ChainError::ChannelUnavailable {
            name: name.to_string(),
            reason: "no such managed process".into(),
        })?;
        match handle.state {
            LifecycleState::Stopped => Err(ChainError::ChannelUnavailable {
                name: name.to_string(),
                reason: "process has stopped".into(),
            }),
            LifecycleState::Stopping => Err(ChainError::ChannelUnavailable {
                name: name.to_string(),
                reason: "process is stopping".into(),
            }),
            _ => Ok(handle.channel),
        }
    }

    pub fn send(&self, name: &str, command: &HostCommand) -> Result<(), ChainError> {
        self.channel(name)?.send_command(command)
    }

    /// Terminate `name`: polite signal, grace period, then the kill signal.
    /// The control channel and the process record are released whatever the
    /// outcome.
    ///
    /// The registry entry stays in place, marked `stopping`, until the files
    /// are gone, so a concurrent `launch` of the same name cannot slip in.
    /// A second `stop` of the same name waits for the first one.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, ChainError> {
        let mut waited = false;
        let (pid, mut child, channel, alive) = loop {
            let taken = match self.processes.get_mut(name) {
                None if waited => return Ok(StopOutcome::AlreadyExited),
                None => {
                    return Err(ChainError::NotFound {
                        name: name.to_string(),
                    });
                }
                Some(mut process) if process.state != LifecycleState::Stopping => {
                    let alive = process.is_alive();
                    process.state = LifecycleState::Stopping;
                    Some((process.pid, process.child.take(), process.channel.clone(), alive))
                }
                Some(_) => None,
            };
            if let Some(taken) = taken {
                break taken;
            }
            waited = true;
            tokio::time::sleep(ADOPTED_POLL).await;
        };

        let outcome = if !alive {
            StopOutcome::AlreadyExited
        } else {
            send_signal(pid, libc::SIGTERM);
            if wait_gone(pid, child.as_mut(), self.grace).await {
                StopOutcome::Graceful
            } else {
                warn!(name, pid, grace_ms = self.grace.as_millis() as u64, "host ignored termination, killing");
                send_signal(pid, libc::SIGKILL);
                if wait_gone(pid, child.as_mut(), KILL_WAIT).await {
                    StopOutcome::Killed
                } else {
                    StopOutcome::Unresponsive
                }
            }
        };

        if let Err(e) = channel.close() {
            warn!(name, error = %e, "could not remove control channel");
        }
        self.layout.remove_record(name);
        self.processes.remove_if(name, |_, p| p.pid == pid);
        info!(name, pid, %outcome, "host stopped");
        Ok(outcome)
    }

    /// Remove channel and record files left behind for a name that is not
    /// managed right now.
    pub fn release_files(&self, name: &str) {
        if self.processes.contains_key(name) {
            return;
        }
        remove_quietly(&self.layout.channel(name));
        self.layout.remove_record(name);
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The group is tried
    // first because hosts are spawned as group leaders.
    let delivered = unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 };
    if !delivered {
        debug!(pid, signal, error = %io::Error::last_os_error(), "signal not delivered");
    }
}

/// Liveness by signal 0; zombies count as dead.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        return io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}
