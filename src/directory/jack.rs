// src/directory/jack.rs

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{error::DirectoryError, port::PortRef};

use super::PortDirectoryType;

/// Talks to a JACK server through the stock command line tools
/// (`jack_lsp`, `jack_connect`, `jack_disconnect`).
#[derive(Debug, Clone)]
pub struct JackPortDirectory {
    lsp: PathBuf,
    connect: PathBuf,
    disconnect: PathBuf,
    timeout: Duration,
}

impl JackPortDirectory {
    pub fn new(lsp: PathBuf, connect: PathBuf, disconnect: PathBuf, timeout: Duration) -> Box<Self> {
        Box::new(Self {
            lsp,
            connect,
            disconnect,
            timeout,
        })
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<String, DirectoryError> {
        trace!(program = %program.display(), ?args, "querying graph daemon");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DirectoryError::Unavailable(format!(
                    "cannot run `{}`: {e}",
                    program.display()
                )));
            }
            Err(_) => {
                return Err(DirectoryError::Unavailable(format!(
                    "`{}` did not answer within {} ms",
                    program.display(),
                    self.timeout.as_millis()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if looks_offline(&stderr) || looks_offline(&stdout) {
            return Err(DirectoryError::Unavailable(if stderr.is_empty() {
                "JACK server not running".to_string()
            } else {
                stderr
            }));
        }
        if !output.status.success() {
            let reason = if stderr.is_empty() {
                format!("`{}` exited with {}", program.display(), output.status)
            } else {
                stderr
            };
            debug!(program = %program.display(), %reason, "graph daemon refused request");
            return Err(DirectoryError::Failed(reason));
        }
        Ok(stdout)
    }
}

fn looks_offline(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("server not running")
        || lower.contains("cannot connect to server")
        || lower.contains("unable to connect to server")
        || lower.contains("failed to connect to server")
}

/// Parse `jack_lsp` output: one port per line.
pub fn parse_ports(output: &str) -> BTreeSet<PortRef> {
    output
        .lines()
        .filter(|l| !l.starts_with(char::is_whitespace))
        .filter_map(|l| l.parse().ok())
        .collect()
}

/// Parse `jack_lsp -c` output and return the peers listed under `port`.
///
/// Connections are printed indented below the port they belong to.
pub fn parse_connections(output: &str, port: &PortRef) -> BTreeSet<PortRef> {
    let wanted = port.to_string();
    let mut peers = BTreeSet::new();
    let mut inside = false;
    for line in output.lines() {
        if line.starts_with(char::is_whitespace) {
            if inside {
                if let Ok(peer) = line.trim().parse() {
                    peers.insert(peer);
                }
            }
        } else {
            inside = line.trim_end() == wanted;
        }
    }
    peers
}

#[async_trait]
impl PortDirectoryType for JackPortDirectory {
    async fn list_ports(&self) -> Result<BTreeSet<PortRef>, DirectoryError> {
        let out = self.run(&self.lsp, &[]).await?;
        Ok(parse_ports(&out))
    }

    async fn list_connections(&self, port: &PortRef) -> Result<BTreeSet<PortRef>, DirectoryError> {
        let out = self.run(&self.lsp, &["-c"]).await?;
        Ok(parse_connections(&out, port))
    }

    async fn connect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.run(&self.connect, &[src.as_str(), dst.as_str()]).await.map(|_| ())
    }

    async fn disconnect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.run(&self.disconnect, &[src.as_str(), dst.as_str()]).await.map(|_| ())
    }

    fn clone_box(&self) -> Box<dyn PortDirectoryType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("JackPortDirectory({})", self.lsp.display())
    }
}
