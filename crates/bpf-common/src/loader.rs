//! Contract between the observer and the kernel side.
//!
//! A [`ProbeLoader`] owns the compiled instrumentation artifact. It attaches its
//! programs to tracepoints, handing back releasable [`TracepointLink`]s, and opens the
//! shared ring buffer as a [`RecordSource`]. [`crate::program::AyaLoader`] is the real
//! implementation; `test-utils` ships in-memory fakes.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A tracepoint an observation point needs attached before it can receive records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tracepoint {
    /// Tracepoint group, eg. `syscalls`
    pub group: &'static str,
    /// Tracepoint name inside the group, eg. `sys_enter_execve`
    pub name: &'static str,
    /// Name of the program inside the instrumentation artifact
    pub program: &'static str,
}

impl Tracepoint {
    pub const fn new(group: &'static str, name: &'static str, program: &'static str) -> Self {
        Self {
            group,
            name,
            program,
        }
    }
}

impl fmt::Display for Tracepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.group, self.name, self.program)
    }
}

/// A single read from the ring buffer.
///
/// When `lost` is non-zero the record is an overflow notification and `payload`
/// carries no data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub cpu: u32,
    pub payload: Bytes,
    pub lost: u64,
}

impl RawRecord {
    pub fn new(cpu: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            cpu,
            payload: payload.into(),
            lost: 0,
        }
    }

    pub fn lost(cpu: u32, lost: u64) -> Self {
        Self {
            cpu,
            payload: Bytes::new(),
            lost,
        }
    }

    pub fn is_lost_notification(&self) -> bool {
        self.lost > 0
    }
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to increase memlock rlimit")]
    Rlimit(#[source] std::io::Error),
    #[error("reading instrumentation artifact {path}")]
    ReadArtifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("loading instrumentation artifact")]
    LoadingProbe(#[from] aya::EbpfError),
    #[error("instrumentation artifact not loaded")]
    NotLoaded,
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed to attach tracepoint {tracepoint}")]
    AttachError {
        tracepoint: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed to release {what}")]
    ReleaseError {
        what: String,
        #[source]
        program_error: Option<Box<aya::programs::ProgramError>>,
    },
    #[error(transparent)]
    MapError(#[from] aya::maps::MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("perf buffer error")]
    PerfBuffer(#[from] aya::maps::perf::PerfBufferError),
    #[error("listing online cpus")]
    OnlineCpus(#[source] std::io::Error),
    #[error("ring buffer reader task failed")]
    ReaderTask(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(String),
}

/// Loads the instrumentation artifact and hands out kernel resources.
///
/// Every operation fails with a descriptive error instead of panicking.
pub trait ProbeLoader: Send + 'static {
    type Link: TracepointLink;
    type Source: RecordSource;

    /// Whether the caller has the privileges needed to load probes.
    fn is_privileged(&self) -> bool;

    /// Raise the memlock resource limit.
    fn bump_memlock_rlimit(&self) -> Result<(), LoaderError>;

    /// Load the compiled instrumentation artifact into the kernel.
    fn load(&mut self) -> Result<(), LoaderError>;

    /// Attach the given program to its tracepoint.
    fn attach_tracepoint(&mut self, tracepoint: &Tracepoint) -> Result<Self::Link, LoaderError>;

    /// Open a reader over the ring buffer map named `map`.
    /// `page_count` is the per-CPU buffer size hint.
    fn open_ring_buffer(&mut self, map: &str, page_count: usize)
    -> Result<Self::Source, LoaderError>;
}

/// Handle to an attached tracepoint.
pub trait TracepointLink: Send + 'static {
    fn tracepoint(&self) -> &Tracepoint;

    /// Detach the program from the tracepoint.
    fn release(self) -> Result<(), LoaderError>;
}

/// Reader side of the shared ring buffer.
#[async_trait]
pub trait RecordSource: Send + 'static {
    /// Wait for the next record. `None` means the source is exhausted.
    ///
    /// A read error is transient: callers are expected to keep reading.
    async fn next_record(&mut self) -> Option<Result<RawRecord, LoaderError>>;

    /// Stop reading and release the ring buffer.
    async fn close(self) -> Result<(), LoaderError>;
}
