//! `ContainerStarted`: process clones, classified by their clone flags.
//!
//! Filtering happens in two stages. Flag filters only look at the record and run
//! first. Records surviving them get the parent and child process metadata resolved
//! from the host, then go through the process filters.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use bpf_common::{
    Pid, RawRecord, Tracepoint,
    parsing::{
        DecodeError, FixedLayout, RecordReader, decode,
        procfs::{ProcessLookup, ProcessMetadata},
    },
};
use slit_core::{
    ConfigError, Disposition, Event, Filter, FilterPipeline, ModuleConfig, ObservationPoint,
    ParseFilterError, Payload, filter::split_filter,
};

pub mod flags;

use flags::{CLONE_PIDFD, CLONE_SYSVSEM, CLONE_VFORK, CloneFlags, flag_names, parse_flags};

pub const MODULE_NAME: &str = "ContainerStarted";

pub const TRACEPOINT: Tracepoint = Tracepoint::new("syscalls", "sys_enter_clone", "enter_clone");

/// Record written by `enter_clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CloneRecord {
    pub parent_tid: u32,
    pub child_tid: u32,
    pub clone_flags: u64,
}

impl FixedLayout for CloneRecord {
    const KIND: &'static str = "clone";
    const SIZE: usize = 16;

    fn read(reader: &mut RecordReader<'_>) -> Self {
        Self {
            parent_tid: reader.u32(),
            child_tid: reader.u32(),
            clone_flags: reader.u64(),
        }
    }
}

/// First stage filters, over the raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneFilter {
    /// Drop clones with any of these flags set
    DropFlagMask(u64),
    /// Keep only clones with at least one of these flags set
    SelectFlagMask(u64),
    DropChildEq0,
    DropFlagsEq0,
}

impl Filter<CloneRecord> for CloneFilter {
    fn drops(&self, record: &CloneRecord) -> bool {
        match self {
            CloneFilter::DropFlagMask(mask) => record.clone_flags & mask != 0,
            CloneFilter::SelectFlagMask(mask) => record.clone_flags & mask == 0,
            CloneFilter::DropChildEq0 => record.child_tid == 0,
            CloneFilter::DropFlagsEq0 => record.clone_flags == 0,
        }
    }
}

impl FromStr for CloneFilter {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mask = |filter: &str, value: Option<&str>| {
            let value = value.ok_or_else(|| ParseFilterError::MissingValue(filter.to_string()))?;
            parse_flags(value).map_err(|err| ParseFilterError::InvalidValue {
                filter: filter.to_string(),
                value: value.to_string(),
                reason: err.to_string(),
            })
        };
        match split_filter(s) {
            (filter @ "drop_flag_mask", value) => Ok(CloneFilter::DropFlagMask(mask(filter, value)?)),
            (filter @ "select_flag_mask", value) => {
                Ok(CloneFilter::SelectFlagMask(mask(filter, value)?))
            }
            ("drop_child_eq0", None) => Ok(CloneFilter::DropChildEq0),
            ("drop_flags_eq0", None) => Ok(CloneFilter::DropFlagsEq0),
            (filter @ ("drop_child_eq0" | "drop_flags_eq0"), Some(value)) => {
                Err(ParseFilterError::InvalidValue {
                    filter: filter.to_string(),
                    value: value.to_string(),
                    reason: "takes no value".to_string(),
                })
            }
            (name, _) => Err(ParseFilterError::Unknown(name.to_string())),
        }
    }
}

/// Parent and child of a clone, as far as the host could tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneProcesses {
    pub parent: Option<ProcessMetadata>,
    pub child: Option<ProcessMetadata>,
}

impl CloneProcesses {
    fn executables(&self) -> impl Iterator<Item = &str> {
        self.parent
            .iter()
            .chain(self.child.iter())
            .map(|process| process.executable.as_str())
    }
}

/// Second stage filters, over the resolved processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFilter {
    /// Drop clones where the parent or the child runs this executable
    DropExecutable(String),
}

impl Filter<CloneProcesses> for ProcessFilter {
    fn drops(&self, processes: &CloneProcesses) -> bool {
        match self {
            ProcessFilter::DropExecutable(name) => {
                processes.executables().any(|executable| executable == name)
            }
        }
    }
}

impl FromStr for ProcessFilter {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_filter(s) {
            ("drop_executable", Some(name)) if !name.is_empty() => {
                Ok(ProcessFilter::DropExecutable(name.to_string()))
            }
            ("drop_executable", _) => Err(ParseFilterError::MissingValue(s.to_string())),
            (name, _) => Err(ParseFilterError::Unknown(name.to_string())),
        }
    }
}

/// Mask and flag filters of the default profile, cheapest first.
pub fn default_filters() -> Vec<CloneFilter> {
    vec![
        CloneFilter::DropFlagMask(CLONE_VFORK),
        CloneFilter::SelectFlagMask(CLONE_PIDFD | CLONE_SYSVSEM),
        CloneFilter::DropChildEq0,
        CloneFilter::DropFlagsEq0,
    ]
}

/// Drop everything spawned by the kernel thread daemon.
pub fn default_process_filters() -> Vec<ProcessFilter> {
    vec![ProcessFilter::DropExecutable("kthreadd".to_string())]
}

#[derive(Clone)]
pub struct ContainerObservationPoint {
    filters: FilterPipeline<CloneFilter>,
    process_filters: FilterPipeline<ProcessFilter>,
    lookup: Arc<dyn ProcessLookup>,
}

impl fmt::Debug for ContainerObservationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerObservationPoint")
            .field("filters", &self.filters)
            .field("process_filters", &self.process_filters)
            .finish()
    }
}

impl ContainerObservationPoint {
    pub fn new(
        filters: Vec<CloneFilter>,
        process_filters: Vec<ProcessFilter>,
        lookup: impl ProcessLookup,
    ) -> Self {
        Self {
            filters: filters.into(),
            process_filters: process_filters.into(),
            lookup: Arc::new(lookup),
        }
    }

    /// Read `filters` and `process_filters`, each falling back to the given default.
    pub fn from_config(
        config: &ModuleConfig,
        filters: Vec<CloneFilter>,
        process_filters: Vec<ProcessFilter>,
        lookup: impl ProcessLookup,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.get_list_with_default("filters", filters)?,
            config.get_list_with_default("process_filters", process_filters)?,
            lookup,
        ))
    }

    /// Resolve both ends of the clone. Reading the process table may block.
    async fn resolve(&self, clone: &CloneRecord) -> CloneProcesses {
        let lookup = self.lookup.clone();
        let (parent_pid, child_pid) = (clone.parent_tid, clone.child_tid);
        tokio::task::spawn_blocking(move || CloneProcesses {
            parent: resolve_one(lookup.as_ref(), parent_pid),
            child: resolve_one(lookup.as_ref(), child_pid),
        })
        .await
        .unwrap_or_else(|err| {
            log::debug!(target: MODULE_NAME, "process lookup task failed: {err}");
            CloneProcesses::default()
        })
    }
}

fn resolve_one(lookup: &dyn ProcessLookup, pid: u32) -> Option<ProcessMetadata> {
    match lookup.lookup(Pid::from_raw(pid as i32)) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            log::debug!(target: MODULE_NAME, "{err}");
            None
        }
    }
}

#[async_trait]
impl ObservationPoint for ContainerObservationPoint {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn tracepoints(&self) -> Vec<Tracepoint> {
        vec![TRACEPOINT]
    }

    async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
        let clone: CloneRecord = decode(&record.payload)?;
        if let Some(filter) = self.filters.first_drop(&clone) {
            log::trace!(
                target: MODULE_NAME,
                "{} -> {} [{}] dropped by {filter:?}",
                clone.parent_tid,
                clone.child_tid,
                CloneFlags(clone.clone_flags)
            );
            return Ok(Disposition::Dropped);
        }

        let processes = self.resolve(&clone).await;
        if self.process_filters.first_drop(&processes).is_some() {
            return Ok(Disposition::Dropped);
        }

        Ok(Disposition::Emit(Event::new(
            record.cpu,
            Payload::ContainerStarted {
                parent_pid: clone.parent_tid,
                child_pid: clone.child_tid,
                clone_flags: clone.clone_flags,
                parent: processes.parent,
                child: processes.child,
                flag_names: flag_names(clone.clone_flags),
            },
        )))
    }
}
