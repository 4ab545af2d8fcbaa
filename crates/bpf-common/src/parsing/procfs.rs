//! Utility functions used to extract process metadata from procfs

use std::{fs, io, path::PathBuf};

use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("process {0} not found")]
    NotFound(i32),
    #[error("parent for process {0} not found")]
    ParentNotFound(i32),
}

/// What the host knows about a running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMetadata {
    pub pid: i32,
    /// Executable name, as found in the process table
    pub executable: String,
    pub parent_pid: i32,
}

/// Resolves a process id to its metadata.
///
/// The subject process may have already exited: failures are expected and callers
/// treat them as missing data.
pub trait ProcessLookup: Send + Sync + 'static {
    fn lookup(&self, pid: Pid) -> Result<ProcessMetadata, LookupError>;
}

/// [`ProcessLookup`] reading `/proc`.
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl Procfs {
    /// Use a procfs mounted somewhere else than `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, pid: Pid, file: &str) -> Result<String, LookupError> {
        let path = self.root.join(pid.to_string()).join(file);
        fs::read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LookupError::NotFound(pid.as_raw())
            } else {
                LookupError::ReadFile {
                    source,
                    path: path.display().to_string(),
                }
            }
        })
    }

    /// Returns the command name for the given process.
    pub fn process_comm(&self, pid: Pid) -> Result<String, LookupError> {
        Ok(self.read(pid, "comm")?.trim().to_owned())
    }

    /// Returns the parent of a given process.
    pub fn process_parent_pid(&self, pid: Pid) -> Result<Pid, LookupError> {
        parse_parent_pid(&self.read(pid, "status")?)
            .ok_or(LookupError::ParentNotFound(pid.as_raw()))
    }
}

impl ProcessLookup for Procfs {
    fn lookup(&self, pid: Pid) -> Result<ProcessMetadata, LookupError> {
        Ok(ProcessMetadata {
            pid: pid.as_raw(),
            executable: self.process_comm(pid)?,
            parent_pid: self.process_parent_pid(pid)?.as_raw(),
        })
    }
}

fn parse_parent_pid(status: &str) -> Option<Pid> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|value| value.trim().parse().ok())
        .map(Pid::from_raw)
}
