//! Named-pipe control channel into a running host process.
//!
//! The pipe is created before the host is spawned. The supervisor keeps a
//! non-blocking read-write handle on it, and the host receives a second
//! read-write handle as its stdin. Because both handles count as reader and
//! writer, neither `open` ever waits for a peer, and the host never sees
//! end-of-file when an orchestrator invocation exits.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};

use crate::{command::HostCommand, error::ChainError};

/// Largest line (including the newline) a pipe writes atomically.
const MAX_LINE: usize = libc::PIPE_BUF;

#[derive(Debug)]
pub struct ControlChannel {
    name: String,
    path: PathBuf,
    writer: Mutex<Option<File>>,
    /// Device and inode of the pipe this channel opened.
    identity: Option<(u64, u64)>,
}

impl ControlChannel {
    /// Create the pipe at `path` (replacing whatever stale file is there) and
    /// open the supervisor's handle on it.
    pub fn create(name: &str, path: &Path) -> Result<Arc<Self>, ChainError> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_fifo() => {
                debug!(channel = %path.display(), "reusing existing control pipe");
            }
            Ok(_) => {
                std::fs::remove_file(path).map_err(|e| ChainError::io(path, e))?;
                make_fifo(path).map_err(|e| ChainError::io(path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                make_fifo(path).map_err(|e| ChainError::io(path, e))?;
            }
            Err(e) => return Err(ChainError::io(path, e)),
        }

        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| ChainError::io(path, e))?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            identity: identity_of(&writer),
            writer: Mutex::new(Some(writer)),
        }))
    }

    /// Attach to a pipe some host is already reading from.
    ///
    /// Fails with `ChannelUnavailable` when the pipe does not exist or nobody
    /// holds it open for reading.
    pub fn attach(name: &str, path: &Path) -> Result<Arc<Self>, ChainError> {
        let unavailable = |reason: String| ChainError::ChannelUnavailable {
            name: name.to_string(),
            reason,
        };
        let meta = std::fs::symlink_metadata(path)
            .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;
        if !meta.file_type().is_fifo() {
            return Err(unavailable(format!("{} is not a pipe", path.display())));
        }
        let writer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENXIO) => unavailable("no host is reading the pipe".into()),
                _ => unavailable(format!("{}: {e}", path.display())),
            })?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            identity: identity_of(&writer),
            writer: Mutex::new(Some(writer)),
        }))
    }

    /// A channel that is already closed but still owns `path`, so that
    /// `close` cleans the file up.
    pub fn detached(name: &str, path: &Path) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            writer: Mutex::new(None),
            identity: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The handle given to the host as its stdin.
    pub fn host_end(&self) -> Result<File, ChainError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| ChainError::io(&self.path, e))
    }

    pub fn is_open(&self) -> bool {
        self.writer.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Write one command line. Never blocks: a closed channel or a full pipe
    /// both report `ChannelUnavailable`.
    pub fn send(&self, command: &str) -> Result<(), ChainError> {
        let command = command.trim_end_matches(['\n', '\r']);
        if command.contains(['\n', '\r']) {
            return Err(ChainError::InvalidCommand(format!(
                "`{}` spans more than one line",
                command.escape_debug()
            )));
        }
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        if line.len() > MAX_LINE {
            return Err(ChainError::InvalidCommand(format!(
                "command of {} bytes exceeds the {MAX_LINE} byte limit",
                line.len()
            )));
        }

        let mut guard = self.writer.lock().map_err(|_| self.unavailable("lock poisoned"))?;
        let writer = guard.as_mut().ok_or_else(|| self.unavailable("channel closed"))?;
        match writer.write(&line) {
            Ok(n) if n == line.len() => {
                trace!(channel = %self.name, %command, "command sent");
                Ok(())
            }
            Ok(n) => Err(self.unavailable(&format!("short write ({n} of {} bytes)", line.len()))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(self.unavailable("pipe full, host is not reading"))
            }
            Err(e) => Err(self.unavailable(&e.to_string())),
        }
    }

    pub fn send_command(&self, command: &HostCommand) -> Result<(), ChainError> {
        let line = command.render()?;
        self.send(&line)
    }

    /// Drop the supervisor's handle and remove the pipe.
    ///
    /// Taking the writer lock first means a send that is already under way
    /// finishes before the file disappears, and every later send sees the
    /// channel as closed instead of reopening the path. A pipe that was
    /// replaced at the same path since this channel opened it is left alone.
    pub fn close(&self) -> Result<(), ChainError> {
        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
        if let Some(opened) = self.identity {
            match std::fs::symlink_metadata(&self.path) {
                Ok(meta) if (meta.dev(), meta.ino()) != opened => {
                    debug!(channel = %self.path.display(), "pipe was replaced, leaving it in place");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                _ => {}
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(channel = %self.path.display(), "control pipe removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChainError::io(&self.path, e)),
        }
    }

    fn unavailable(&self, reason: &str) -> ChainError {
        ChainError::ChannelUnavailable {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

fn identity_of(file: &File) -> Option<(u64, u64)> {
    file.metadata().ok().map(|meta| (meta.dev(), meta.ino()))
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
