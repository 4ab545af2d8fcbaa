//! In-memory stand-ins for the kernel collaborators, used to test the observer
//! without loading anything in the kernel.
//!
//! ```ignore
//! let (loader, feeder) = FakeLoader::new();
//! let kernel = loader.kernel();
//! feeder.send(RawRecord::new(0, payload));
//! // ... run the observer ...
//! assert_eq!(kernel.released().len(), kernel.attached().len());
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use nix::unistd::Pid;
use tokio::sync::mpsc;

use crate::{
    loader::{LoaderError, ProbeLoader, RawRecord, RecordSource, Tracepoint, TracepointLink},
    parsing::procfs::{LookupError, ProcessLookup, ProcessMetadata},
};

/// Shared view of what happened to the fake kernel resources.
#[derive(Clone, Default)]
pub struct FakeKernel {
    inner: Arc<Mutex<FakeKernelState>>,
}

#[derive(Default)]
struct FakeKernelState {
    loaded: bool,
    attached: Vec<Tracepoint>,
    release_attempts: Vec<Tracepoint>,
    ring_buffer_open: bool,
    ring_buffer_closed: bool,
}

impl FakeKernel {
    fn with<T>(&self, f: impl FnOnce(&mut FakeKernelState) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn loaded(&self) -> bool {
        self.with(|state| state.loaded)
    }

    pub fn attached(&self) -> Vec<Tracepoint> {
        self.with(|state| state.attached.clone())
    }

    /// Every tracepoint a release was attempted on, failed ones included.
    pub fn release_attempts(&self) -> Vec<Tracepoint> {
        self.with(|state| state.release_attempts.clone())
    }

    pub fn ring_buffer_open(&self) -> bool {
        self.with(|state| state.ring_buffer_open)
    }

    pub fn ring_buffer_closed(&self) -> bool {
        self.with(|state| state.ring_buffer_closed)
    }
}

/// Pushes records into a [`FakeRecordSource`].
#[derive(Clone)]
pub struct RecordFeeder {
    tx: mpsc::UnboundedSender<Result<RawRecord, LoaderError>>,
}

impl RecordFeeder {
    pub fn send(&self, record: RawRecord) {
        let _ = self.tx.send(Ok(record));
    }

    pub fn send_error(&self, msg: &str) {
        let _ = self.tx.send(Err(LoaderError::Other(msg.to_string())));
    }
}

pub struct FakeLoader {
    kernel: FakeKernel,
    rx: Option<mpsc::UnboundedReceiver<Result<RawRecord, LoaderError>>>,
    privileged: bool,
    fail_attach: HashSet<&'static str>,
    fail_release: HashSet<&'static str>,
    fail_open: bool,
    fail_close: bool,
}

impl FakeLoader {
    pub fn new() -> (Self, RecordFeeder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let loader = Self {
            kernel: FakeKernel::default(),
            rx: Some(rx),
            privileged: true,
            fail_attach: HashSet::new(),
            fail_release: HashSet::new(),
            fail_open: false,
            fail_close: false,
        };
        (loader, RecordFeeder { tx })
    }

    pub fn kernel(&self) -> FakeKernel {
        self.kernel.clone()
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    /// Attaching the tracepoint with this name will fail.
    pub fn failing_attach(mut self, tracepoint: &'static str) -> Self {
        self.fail_attach.insert(tracepoint);
        self
    }

    /// Releasing the tracepoint with this name will fail.
    pub fn failing_release(mut self, tracepoint: &'static str) -> Self {
        self.fail_release.insert(tracepoint);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl ProbeLoader for FakeLoader {
    type Link = FakeLink;
    type Source = FakeRecordSource;

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn bump_memlock_rlimit(&self) -> Result<(), LoaderError> {
        if self.privileged {
            Ok(())
        } else {
            Err(LoaderError::Rlimit(std::io::Error::from_raw_os_error(
                libc::EPERM,
            )))
        }
    }

    fn load(&mut self) -> Result<(), LoaderError> {
        self.kernel.with(|state| state.loaded = true);
        Ok(())
    }

    fn attach_tracepoint(&mut self, tracepoint: &Tracepoint) -> Result<FakeLink, LoaderError> {
        if !self.kernel.loaded() {
            return Err(LoaderError::NotLoaded);
        }
        if self.fail_attach.contains(tracepoint.name) {
            return Err(LoaderError::Other(format!("cannot attach {tracepoint}")));
        }
        self.kernel
            .with(|state| state.attached.push(tracepoint.clone()));
        Ok(FakeLink {
            tracepoint: tracepoint.clone(),
            kernel: self.kernel.clone(),
            fail: self.fail_release.contains(tracepoint.name),
        })
    }

    fn open_ring_buffer(
        &mut self,
        map: &str,
        _page_count: usize,
    ) -> Result<FakeRecordSource, LoaderError> {
        if self.fail_open {
            return Err(LoaderError::MapNotFound(map.to_string()));
        }
        let rx = self
            .rx
            .take()
            .ok_or_else(|| LoaderError::Other(format!("ring buffer {map} already open")))?;
        self.kernel.with(|state| state.ring_buffer_open = true);
        Ok(FakeRecordSource {
            rx,
            kernel: self.kernel.clone(),
            fail_close: self.fail_close,
        })
    }
}

pub struct FakeLink {
    tracepoint: Tracepoint,
    kernel: FakeKernel,
    fail: bool,
}

impl TracepointLink for FakeLink {
    fn tracepoint(&self) -> &Tracepoint {
        &self.tracepoint
    }

    fn release(self) -> Result<(), LoaderError> {
        self.kernel
            .with(|state| state.release_attempts.push(self.tracepoint.clone()));
        if self.fail {
            Err(LoaderError::ReleaseError {
                what: format!("tracepoint {}", self.tracepoint),
                program_error: None,
            })
        } else {
            Ok(())
        }
    }
}

pub struct FakeRecordSource {
    rx: mpsc::UnboundedReceiver<Result<RawRecord, LoaderError>>,
    kernel: FakeKernel,
    fail_close: bool,
}

#[async_trait]
impl RecordSource for FakeRecordSource {
    async fn next_record(&mut self) -> Option<Result<RawRecord, LoaderError>> {
        self.rx.recv().await
    }

    async fn close(self) -> Result<(), LoaderError> {
        self.kernel.with(|state| state.ring_buffer_closed = true);
        if self.fail_close {
            Err(LoaderError::ReleaseError {
                what: "ring buffer".to_string(),
                program_error: None,
            })
        } else {
            Ok(())
        }
    }
}

/// [`ProcessLookup`] over a fixed process table. Unknown pids are not found.
#[derive(Clone, Default)]
pub struct FakeLookup {
    processes: Arc<HashMap<i32, ProcessMetadata>>,
    calls: Arc<AtomicUsize>,
}

impl FakeLookup {
    pub fn new(processes: impl IntoIterator<Item = (i32, &'static str, i32)>) -> Self {
        let processes = processes
            .into_iter()
            .map(|(pid, executable, parent_pid)| {
                (
                    pid,
                    ProcessMetadata {
                        pid,
                        executable: executable.to_string(),
                        parent_pid,
                    },
                )
            })
            .collect();
        Self {
            processes: Arc::new(processes),
            calls: Arc::default(),
        }
    }

    /// Number of lookups performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessLookup for FakeLookup {
    fn lookup(&self, pid: Pid) -> Result<ProcessMetadata, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.processes
            .get(&pid.as_raw())
            .cloned()
            .ok_or(LookupError::NotFound(pid.as_raw()))
    }
}
