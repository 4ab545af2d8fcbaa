//! The [`Observer`] owns the kernel resources and the single ring buffer consumer loop.
//!
//! Lifecycle: `Created -> Started -> Running -> ShuttingDown -> Stopped`.
//!
//! Records are read one at a time, in arrival order. Every observation point runs in
//! its own task fed by a FIFO queue: points work concurrently with each other and with
//! the reader, while the events of a single point keep the order of the records they
//! come from. Lost sample notifications never reach the points.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bpf_common::{LoaderError, ProbeLoader, RawRecord, RecordSource, TracepointLink, log_error};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    bus::{Bus, EventStream},
    error::ObserverError,
    point::{Disposition, ObservationPoint},
    profile::Profile,
    shutdown::ShutdownSignal,
};

/// Name of the ring buffer map in the instrumentation artifact.
pub const RING_BUFFER_DEFAULT: &str = "events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ObserverState {
    Created,
    Started,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ObserverOptions {
    /// Ring buffer map name
    pub ring_buffer: String,
    /// Per-CPU buffer size hint, in pages
    pub perf_pages: usize,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            ring_buffer: RING_BUFFER_DEFAULT.to_string(),
            perf_pages: bpf_common::PERF_PAGES_DEFAULT,
        }
    }
}

/// Counters updated by the consumer loop.
#[derive(Debug, Default)]
pub struct ObserverStats {
    records: AtomicU64,
    lost_notifications: AtomicU64,
    lost_samples: AtomicU64,
    read_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records dispatched to the observation points
    pub records: u64,
    pub lost_notifications: u64,
    /// Sum of the samples reported lost by the kernel
    pub lost_samples: u64,
    pub read_errors: u64,
}

impl ObserverStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            lost_notifications: self.lost_notifications.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Summary of a clean shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tracepoints a release was attempted on
    pub released: usize,
    /// Tracepoints whose release failed. Logged, not fatal.
    pub release_failures: Vec<String>,
    pub stats: StatsSnapshot,
}

/// Check the caller can load probes, then raise the memlock limit.
pub fn preflight<L: ProbeLoader>(loader: &L) -> Result<(), ObserverError> {
    if !loader.is_privileged() {
        return Err(ObserverError::NotPrivileged);
    }
    loader.bump_memlock_rlimit().map_err(ObserverError::Setup)
}

pub struct Observer<L: ProbeLoader> {
    loader: L,
    profile: Profile,
    options: ObserverOptions,
    bus: Bus,
    stats: Arc<ObserverStats>,
    state: watch::Sender<ObserverState>,
    links: Vec<L::Link>,
    source: Option<L::Source>,
}

impl<L: ProbeLoader> Observer<L> {
    pub fn new(loader: L, profile: Profile, options: ObserverOptions) -> Self {
        let (state, _) = watch::channel(ObserverState::Created);
        Self {
            loader,
            profile,
            options,
            bus: Bus::new(),
            stats: Arc::default(),
            state,
            links: Vec::new(),
            source: None,
        }
    }

    /// A reader of the outbound events. Can be called more than once, readers compete.
    pub fn events(&self) -> EventStream {
        self.bus.stream()
    }

    pub fn stats(&self) -> Arc<ObserverStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> ObserverState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ObserverState> {
        self.state.subscribe()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Load the instrumentation, attach every tracepoint and open the ring buffer.
    ///
    /// On failure everything already attached is released and the observer is
    /// [`ObserverState::Stopped`].
    pub fn start(&mut self) -> Result<(), ObserverError> {
        if self.state() != ObserverState::Created {
            return Err(ObserverError::InvalidState(self.state()));
        }
        if let Err(err) = self.acquire() {
            self.release_links();
            self.state.send_replace(ObserverState::Stopped);
            return Err(err);
        }
        self.state.send_replace(ObserverState::Started);
        Ok(())
    }

    fn acquire(&mut self) -> Result<(), ObserverError> {
        self.loader.load().map_err(ObserverError::Setup)?;

        for tracepoint in self.profile.tracepoints() {
            let link = self
                .loader
                .attach_tracepoint(&tracepoint)
                .map_err(|source| ObserverError::Attach {
                    tracepoint: tracepoint.to_string(),
                    source,
                })?;
            log::info!("Attached {tracepoint}");
            self.links.push(link);
        }

        let source = self
            .loader
            .open_ring_buffer(&self.options.ring_buffer, self.options.perf_pages)
            .map_err(|source| ObserverError::RingBufferOpen {
                map: self.options.ring_buffer.clone(),
                source,
            })?;
        self.source = Some(source);
        Ok(())
    }

    /// Release every link, each independently of the others.
    /// Returns the tracepoints that failed.
    fn release_links(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for link in self.links.drain(..) {
            let tracepoint = link.tracepoint().to_string();
            match link.release() {
                Ok(()) => log::debug!("Released {tracepoint}"),
                Err(err) => {
                    log_error(&format!("Releasing {tracepoint}"), err);
                    failures.push(tracepoint);
                }
            }
        }
        failures
    }

    /// Run the consumer loop until `shutdown` fires or the ring buffer is exhausted,
    /// then release every kernel resource.
    ///
    /// Starts the observer if needed. Only a ring buffer that can't be closed makes
    /// an otherwise clean shutdown fail.
    pub async fn run(
        mut self,
        mut shutdown: ShutdownSignal,
    ) -> Result<ShutdownReport, ObserverError> {
        if self.state() == ObserverState::Created {
            self.start()?;
        }
        let state = self.state();
        let Some(mut source) = self.source.take() else {
            return Err(ObserverError::InvalidState(state));
        };

        let (queues, workers): (Vec<_>, Vec<_>) = self
            .profile
            .points()
            .map(|point| spawn_worker(point.clone(), self.bus.clone()))
            .unzip();

        self.state.send_replace(ObserverState::Running);
        log::info!(
            "Observing with profile {} ({})",
            self.profile.name(),
            self.profile.names().collect::<Vec<_>>().join(", ")
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Shutting down now!");
                    break;
                }
                record = source.next_record() => match record {
                    Some(Ok(record)) => self.dispatch(record, &queues),
                    Some(Err(err)) => {
                        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Reading from the ring buffer: {err}");
                    }
                    None => {
                        log::warn!("Ring buffer exhausted");
                        break;
                    }
                }
            }
        }

        self.state.send_replace(ObserverState::ShuttingDown);
        let released = self.links.len();
        let release_failures = self.release_links();
        let closed = source.close().await;

        // Let the points drain their queues before the event stream ends.
        drop(queues);
        for worker in workers {
            if let Err(err) = worker.await {
                log::error!("Observation point task failed: {err}");
            }
        }
        self.state.send_replace(ObserverState::Stopped);

        closed.map_err(|err: LoaderError| {
            log::error!("Closing the ring buffer failed: {err}");
            ObserverError::RingBufferClose(err)
        })?;

        Ok(ShutdownReport {
            released,
            release_failures,
            stats: self.stats.snapshot(),
        })
    }

    fn dispatch(&self, record: RawRecord, queues: &[mpsc::UnboundedSender<RawRecord>]) {
        if record.is_lost_notification() {
            self.stats.lost_notifications.fetch_add(1, Ordering::Relaxed);
            self.stats
                .lost_samples
                .fetch_add(record.lost, Ordering::Relaxed);
            log::warn!("Lost {} samples on CPU {}", record.lost, record.cpu);
            return;
        }
        self.stats.records.fetch_add(1, Ordering::Relaxed);
        for queue in queues {
            // Workers live until their queue is dropped
            let _ = queue.send(record.clone());
        }
    }
}

fn spawn_worker(
    point: Arc<dyn ObservationPoint>,
    bus: Bus,
) -> (mpsc::UnboundedSender<RawRecord>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RawRecord>();
    let worker = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            match point.handle(&record).await {
                Ok(Disposition::Emit(event)) => bus.send(event),
                Ok(Disposition::Dropped) => {}
                Err(err) => log::debug!(target: point.name(), "{err}"),
            }
        }
    });
    (tx, worker)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use bpf_common::{
        RawRecord, Tracepoint,
        parsing::{DecodeError, FixedLayout, RecordReader, decode},
        test_utils::{FakeLoader, RecordFeeder},
    };

    use super::*;
    use crate::{
        event::{Event, Payload},
        shutdown::ShutdownSender,
    };

    const EXECVE: Tracepoint = Tracepoint::new("syscalls", "sys_enter_execve", "enter_execve");
    const SIGNAL: Tracepoint = Tracepoint::new("signal", "signal_deliver", "signal_deliver");

    struct Pid(u32);

    impl FixedLayout for Pid {
        const KIND: &'static str = "pid";
        const SIZE: usize = 4;

        fn read(reader: &mut RecordReader<'_>) -> Self {
            Self(reader.u32())
        }
    }

    /// Emits a ProcessExecuted event for every 4 bytes record, drops pid 0.
    struct PidPoint;

    #[async_trait]
    impl ObservationPoint for PidPoint {
        fn name(&self) -> &'static str {
            "Pid"
        }

        fn tracepoints(&self) -> Vec<Tracepoint> {
            vec![EXECVE]
        }

        async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
            let Pid(pid) = decode(&record.payload)?;
            if pid == 0 {
                return Ok(Disposition::Dropped);
            }
            Ok(Disposition::Emit(Event::new(
                record.cpu,
                Payload::ProcessExecuted {
                    pid,
                    filename: String::new(),
                    comm: String::new(),
                },
            )))
        }
    }

    struct Wide(u64);

    impl FixedLayout for Wide {
        const KIND: &'static str = "wide";
        const SIZE: usize = 8;

        fn read(reader: &mut RecordReader<'_>) -> Self {
            Self(reader.u64())
        }
    }

    /// Needs 8 bytes records, fails to decode the 4 bytes ones.
    struct WidePoint;

    #[async_trait]
    impl ObservationPoint for WidePoint {
        fn name(&self) -> &'static str {
            "Wide"
        }

        fn tracepoints(&self) -> Vec<Tracepoint> {
            vec![SIGNAL, EXECVE]
        }

        async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
            let Wide(value) = decode(&record.payload)?;
            Ok(Disposition::Emit(Event::new(
                record.cpu,
                Payload::SignalDelivered {
                    signal: value as i32,
                    errno: 0,
                    code: 0,
                    handler: 0,
                    flags: 0,
                },
            )))
        }
    }

    fn pid_record(pid: u32) -> RawRecord {
        RawRecord::new(0, pid.to_le_bytes().to_vec())
    }

    fn pid_of(event: &Event) -> u32 {
        match event.payload {
            Payload::ProcessExecuted { pid, .. } => pid,
            _ => panic!("unexpected event {event}"),
        }
    }

    async fn next(stream: &EventStream) -> Event {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timeout waiting for an event")
            .expect("stream ended")
    }

    struct Harness {
        feeder: RecordFeeder,
        kernel: bpf_common::test_utils::FakeKernel,
        events: EventStream,
        stats: Arc<ObserverStats>,
        tx_shutdown: ShutdownSender,
        task: JoinHandle<Result<ShutdownReport, ObserverError>>,
    }

    fn spawn(loader: FakeLoader, feeder: RecordFeeder, profile: Profile) -> Harness {
        let kernel = loader.kernel();
        let observer = Observer::new(loader, profile, ObserverOptions::default());
        let events = observer.events();
        let stats = observer.stats();
        let (tx_shutdown, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(observer.run(shutdown));
        Harness {
            feeder,
            kernel,
            events,
            stats,
            tx_shutdown,
            task,
        }
    }

    fn pid_profile() -> Profile {
        Profile::new("test").with(PidPoint).unwrap()
    }

    impl Harness {
        async fn stop(self) -> Result<ShutdownReport, ObserverError> {
            self.tx_shutdown.send_signal();
            self.task.await.unwrap()
        }
    }

    #[tokio::test]
    async fn events_keep_the_ring_buffer_order() {
        let (loader, feeder) = FakeLoader::new();
        let harness = spawn(loader, feeder, pid_profile());
        for pid in 1..=100 {
            harness.feeder.send(pid_record(pid));
        }
        for pid in 1..=100 {
            assert_eq!(pid_of(&next(&harness.events).await), pid);
        }
        let report = harness.stop().await.unwrap();
        assert_eq!(report.stats.records, 100);
    }

    #[tokio::test]
    async fn lost_samples_never_reach_the_points() {
        let (loader, feeder) = FakeLoader::new();
        let harness = spawn(loader, feeder, pid_profile());
        harness.feeder.send(RawRecord::lost(1, 7));
        harness.feeder.send(pid_record(42));

        let event = next(&harness.events).await;
        assert_eq!(pid_of(&event), 42);
        assert_eq!(event.cpu, 0);
        assert!(harness.events.try_next().is_none());

        let stats = harness.stats.snapshot();
        assert_eq!(stats.lost_notifications, 1);
        assert_eq!(stats.lost_samples, 7);
        assert_eq!(stats.records, 1);
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn read_errors_do_not_stop_the_loop() {
        let (loader, feeder) = FakeLoader::new();
        let harness = spawn(loader, feeder, pid_profile());
        harness.feeder.send_error("transient");
        harness.feeder.send(pid_record(5));
        assert_eq!(pid_of(&next(&harness.events).await), 5);
        assert_eq!(harness.stats.snapshot().read_errors, 1);
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn decode_failures_are_local_to_a_point() {
        let (loader, feeder) = FakeLoader::new();
        let profile = pid_profile().with(WidePoint).unwrap();
        let harness = spawn(loader, feeder, profile);

        // Too short for WidePoint, fine for PidPoint
        harness.feeder.send(pid_record(3));
        assert_eq!(pid_of(&next(&harness.events).await), 3);

        // Good for both
        harness
            .feeder
            .send(RawRecord::new(2, 9u64.to_le_bytes().to_vec()));
        let mut kinds = vec![
            next(&harness.events).await.name(),
            next(&harness.events).await.name(),
        ];
        kinds.sort();
        assert_eq!(kinds, vec!["ProcessExecuted", "SignalDelivered"]);
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let (loader, feeder) = FakeLoader::new();
        let profile = pid_profile().with(WidePoint).unwrap();
        let harness = spawn(loader, feeder, profile);
        harness.feeder.send(pid_record(1));
        next(&harness.events).await;

        let kernel = harness.kernel.clone();
        let events = harness.events.clone();
        let report = harness.stop().await.unwrap();

        // Shared tracepoints are attached once
        assert_eq!(kernel.attached(), vec![EXECVE, SIGNAL]);
        assert_eq!(kernel.release_attempts(), kernel.attached());
        assert!(kernel.ring_buffer_closed());
        assert_eq!(report.released, 2);
        assert!(report.release_failures.is_empty());
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn release_failures_are_not_fatal() {
        let (loader, feeder) = FakeLoader::new();
        let loader = loader.failing_release("sys_enter_execve");
        let profile = pid_profile().with(WidePoint).unwrap();
        let harness = spawn(loader, feeder, profile);
        let kernel = harness.kernel.clone();

        let report = harness.stop().await.unwrap();
        assert_eq!(kernel.release_attempts().len(), 2);
        assert_eq!(report.release_failures, vec![EXECVE.to_string()]);
        assert!(kernel.ring_buffer_closed());
    }

    #[tokio::test]
    async fn ring_buffer_close_failure_is_reported() {
        let (loader, feeder) = FakeLoader::new();
        let loader = loader.failing_close();
        let harness = spawn(loader, feeder, pid_profile());
        let kernel = harness.kernel.clone();

        let result = harness.stop().await;
        assert!(matches!(result, Err(ObserverError::RingBufferClose(_))));
        assert_eq!(kernel.release_attempts(), vec![EXECVE]);
    }

    #[tokio::test]
    async fn exhausted_source_stops_the_observer() {
        let (loader, feeder) = FakeLoader::new();
        let kernel = loader.kernel();
        let observer = Observer::new(loader, pid_profile(), ObserverOptions::default());
        let state = observer.subscribe_state();
        let (_tx_shutdown, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(observer.run(shutdown));

        feeder.send(pid_record(1));
        drop(feeder);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.stats.records, 1);
        assert!(kernel.ring_buffer_closed());
        assert_eq!(*state.borrow(), ObserverState::Stopped);
    }

    #[tokio::test]
    async fn attach_failure_releases_what_was_attached() {
        let (loader, _feeder) = FakeLoader::new();
        let loader = loader.failing_attach("sys_enter_execve");
        let kernel = loader.kernel();
        let profile = Profile::new("test").with(WidePoint).unwrap();
        let mut observer = Observer::new(loader, profile, ObserverOptions::default());

        let err = observer.start().unwrap_err();
        assert!(matches!(err, ObserverError::Attach { .. }));
        assert_eq!(kernel.attached(), vec![SIGNAL]);
        assert_eq!(kernel.release_attempts(), vec![SIGNAL]);
        assert!(!kernel.ring_buffer_open());
        assert_eq!(observer.state(), ObserverState::Stopped);
    }

    #[tokio::test]
    async fn ring_buffer_open_failure_aborts_start() {
        let (loader, _feeder) = FakeLoader::new();
        let loader = loader.failing_open();
        let kernel = loader.kernel();
        let observer = Observer::new(loader, pid_profile(), ObserverOptions::default());
        let (_tx_shutdown, shutdown) = ShutdownSignal::new();

        let err = observer.run(shutdown).await.unwrap_err();
        assert!(matches!(err, ObserverError::RingBufferOpen { .. }));
        assert_eq!(kernel.release_attempts(), vec![EXECVE]);
    }

    #[tokio::test]
    async fn start_happens_once() {
        let (loader, _feeder) = FakeLoader::new();
        let mut observer = Observer::new(loader, pid_profile(), ObserverOptions::default());
        assert_eq!(observer.state(), ObserverState::Created);
        observer.start().unwrap();
        assert_eq!(observer.state(), ObserverState::Started);
        assert!(matches!(
            observer.start(),
            Err(ObserverError::InvalidState(ObserverState::Started))
        ));
    }

    #[test]
    fn preflight_requires_privileges() {
        let (loader, _feeder) = FakeLoader::new();
        assert!(preflight(&loader).is_ok());
        let loader = loader.unprivileged();
        assert!(matches!(
            preflight(&loader),
            Err(ObserverError::NotPrivileged)
        ));
    }
}
