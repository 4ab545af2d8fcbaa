//! [`AyaLoader`] is the [`ProbeLoader`] backed by [`aya::Ebpf`]:
//! - loads the compiled instrumentation artifact from disk
//! - attaches tracepoint programs, handing back releasable links
//! - runs one background task per CPU reading the shared perf event array and
//!   funnels everything into a single [`PerfRecordSource`].

use std::{
    collections::HashSet,
    convert::TryFrom,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use aya::{
    Btf, Ebpf, EbpfLoader,
    maps::perf::{AsyncPerfEventArray, PerfBufferError},
    programs::{TracePoint, links::Link, trace_point::TracePointLink},
    util::online_cpus,
};
use bytes::BytesMut;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    RecordSender, RecordSenderWrapper,
    loader::{LoaderError, ProbeLoader, RawRecord, RecordSource, Tracepoint, TracepointLink},
    preflight,
};

/// Default per-CPU perf buffer size, in pages.
pub const PERF_PAGES_DEFAULT: usize = 64;

/// Number of buffers handed to every `read_events` call.
const READ_BATCH: usize = 16;

/// Initial capacity of every read buffer. Records are small fixed layouts.
const RECORD_CAPACITY: usize = 256;

/// Normalize a perf page count: it must be a power of 2.
pub fn perf_pages_or_default(perf_pages: usize) -> usize {
    if perf_pages == 0 || (perf_pages & (perf_pages - 1) != 0) {
        log::warn!("Invalid value ({perf_pages}) for perf_pages, which must be a power of 2.");
        log::warn!("The default value {PERF_PAGES_DEFAULT} will be used.");
        PERF_PAGES_DEFAULT
    } else {
        perf_pages
    }
}

pub struct AyaLoader {
    /// Path of the compiled instrumentation object file
    artifact: PathBuf,
    bpf: Option<Ebpf>,
    /// Programs already loaded in the kernel. A program may serve more than one tracepoint.
    loaded_programs: HashSet<String>,
}

impl AyaLoader {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            bpf: None,
            loaded_programs: HashSet::new(),
        }
    }

    fn bpf(&mut self) -> Result<&mut Ebpf, LoaderError> {
        self.bpf.as_mut().ok_or(LoaderError::NotLoaded)
    }
}

impl ProbeLoader for AyaLoader {
    type Link = AyaLink;
    type Source = PerfRecordSource;

    fn is_privileged(&self) -> bool {
        preflight::is_privileged()
    }

    fn bump_memlock_rlimit(&self) -> Result<(), LoaderError> {
        preflight::bump_memlock_rlimit()
    }

    fn load(&mut self) -> Result<(), LoaderError> {
        let probe = std::fs::read(&self.artifact).map_err(|source| LoaderError::ReadArtifact {
            path: self.artifact.display().to_string(),
            source,
        })?;
        let btf = match Btf::from_sys_fs() {
            Ok(btf) => Some(btf),
            Err(err) => {
                log::warn!("BTF not available, loading without it: {err}");
                None
            }
        };
        log::info!("Loading instrumentation {}", self.artifact.display());
        let bpf = EbpfLoader::new().btf(btf.as_ref()).load(&probe)?;
        self.bpf = Some(bpf);
        self.loaded_programs.clear();
        Ok(())
    }

    fn attach_tracepoint(&mut self, tracepoint: &Tracepoint) -> Result<AyaLink, LoaderError> {
        let needs_load = !self.loaded_programs.contains(tracepoint.program);
        let program: &mut TracePoint = extract_program(self.bpf()?, tracepoint.program)?;
        if needs_load {
            program
                .load()
                .map_err(|program_error| LoaderError::ProgramLoadError {
                    program: tracepoint.program.to_string(),
                    program_error: Box::new(program_error),
                })?;
        }
        let attach_err = |program_error| LoaderError::AttachError {
            tracepoint: tracepoint.to_string(),
            program_error: Box::new(program_error),
        };
        let link_id = program
            .attach(tracepoint.group, tracepoint.name)
            .map_err(attach_err)?;
        let link = program.take_link(link_id).map_err(attach_err)?;
        self.loaded_programs.insert(tracepoint.program.to_string());
        Ok(AyaLink {
            tracepoint: tracepoint.clone(),
            link,
        })
    }

    fn open_ring_buffer(
        &mut self,
        map: &str,
        page_count: usize,
    ) -> Result<PerfRecordSource, LoaderError> {
        let map_resource = self
            .bpf()?
            .take_map(map)
            .ok_or_else(|| LoaderError::MapNotFound(map.to_string()))?;
        let mut perf_array = AsyncPerfEventArray::try_from(map_resource)?;
        let page_count = perf_pages_or_default(page_count);

        let cpus = online_cpus().map_err(|(_, err)| LoaderError::OnlineCpus(err))?;
        let buffers = cpus
            .into_iter()
            .map(|cpu| perf_array.open(cpu, Some(page_count)).map(|buf| (cpu, buf)))
            .collect::<Result<Vec<_>, PerfBufferError>>()?;

        // Readers are notified of shutdown when the sender is dropped.
        let (tx_exit, _) = watch::channel(());
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarded = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::with_capacity(buffers.len());
        for (cpu, mut buf) in buffers {
            let counter = forwarded.clone();
            let mut sender = RecordSenderWrapper::new(tx.clone(), move |_: &RawRecord| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            let mut rx_exit = tx_exit.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut buffers = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(RECORD_CAPACITY))
                    .collect::<Vec<_>>();
                loop {
                    let events = tokio::select! {
                        Err(_) = rx_exit.changed() => return,
                        events = buf.read_events(&mut buffers) => events,
                    };
                    let delivered = match events {
                        Ok(events) => {
                            let mut delivered = true;
                            if events.lost > 0 {
                                delivered &= sender.send(Ok(RawRecord::lost(cpu, events.lost as u64)));
                            }
                            for buffer in buffers.iter_mut().take(events.read) {
                                let buffer = std::mem::replace(
                                    buffer,
                                    BytesMut::with_capacity(RECORD_CAPACITY),
                                );
                                delivered &= sender.send(Ok(RawRecord::new(cpu, buffer.freeze())));
                            }
                            delivered
                        }
                        Err(err) => {
                            let delivered = sender.send(Err(err.into()));
                            tokio::task::yield_now().await;
                            delivered
                        }
                    };
                    if !delivered {
                        return;
                    }
                }
            }));
        }
        log::info!("Reading ring buffer {map} on {} cpus", tasks.len());

        Ok(PerfRecordSource {
            rx,
            tx_exit,
            tasks,
            forwarded,
        })
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, LoaderError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| LoaderError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| LoaderError::ProgramTypeError(program.to_string()))
}

pub struct AyaLink {
    tracepoint: Tracepoint,
    link: TracePointLink,
}

impl TracepointLink for AyaLink {
    fn tracepoint(&self) -> &Tracepoint {
        &self.tracepoint
    }

    fn release(self) -> Result<(), LoaderError> {
        self.link
            .detach()
            .map_err(|program_error| LoaderError::ReleaseError {
                what: format!("tracepoint {}", self.tracepoint),
                program_error: Some(Box::new(program_error)),
            })
    }
}

/// Single consumer view over all the per-CPU perf buffers.
pub struct PerfRecordSource {
    rx: mpsc::UnboundedReceiver<Result<RawRecord, LoaderError>>,
    tx_exit: watch::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    forwarded: Arc<AtomicU64>,
}

#[async_trait]
impl RecordSource for PerfRecordSource {
    async fn next_record(&mut self) -> Option<Result<RawRecord, LoaderError>> {
        self.rx.recv().await
    }

    async fn close(self) -> Result<(), LoaderError> {
        let PerfRecordSource {
            mut rx,
            tx_exit,
            tasks,
            forwarded,
        } = self;
        drop(tx_exit);
        rx.close();
        let mut result = Ok(());
        for task in tasks {
            if let Err(err) = task.await {
                log::error!("Ring buffer reader failed: {err}");
                result = Err(LoaderError::ReaderTask(err));
            }
        }
        log::debug!(
            "Ring buffer closed after {} records",
            forwarded.load(Ordering::Relaxed)
        );
        result
    }
}
