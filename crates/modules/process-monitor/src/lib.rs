//! `ProcessExecuted`: every `execve` entering the kernel.

use std::str::FromStr;

use async_trait::async_trait;
use bpf_common::{
    RawRecord, Tracepoint,
    parsing::{DecodeError, FixedLayout, RecordReader, c_string, decode},
};
use slit_core::{
    ConfigError, Disposition, Event, Filter, FilterPipeline, ModuleConfig, ObservationPoint,
    ParseFilterError, Payload, filter::split_filter,
};

pub const MODULE_NAME: &str = "ProcessExecuted";

pub const TRACEPOINT: Tracepoint =
    Tracepoint::new("syscalls", "sys_enter_execve", "enter_execve");

/// Record written by `enter_execve`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ExecveRecord {
    pub pid: u32,
    pub filename: [u8; 32],
    pub comm: [u8; 32],
}

impl FixedLayout for ExecveRecord {
    const KIND: &'static str = "execve";
    const SIZE: usize = 68;

    fn read(reader: &mut RecordReader<'_>) -> Self {
        Self {
            pid: reader.u32(),
            filename: reader.array(),
            comm: reader.array(),
        }
    }
}

impl ExecveRecord {
    pub fn filename(&self) -> String {
        c_string(&self.filename)
    }

    pub fn comm(&self) -> String {
        c_string(&self.comm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecveFilter {
    /// Drop executions of this exact file name. Empty matches records with no file name.
    DropFilename(String),
}

impl Filter<ExecveRecord> for ExecveFilter {
    fn drops(&self, record: &ExecveRecord) -> bool {
        match self {
            ExecveFilter::DropFilename(filename) => record.filename() == *filename,
        }
    }
}

impl FromStr for ExecveFilter {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_filter(s) {
            ("drop_filename", Some(filename)) => Ok(ExecveFilter::DropFilename(filename.to_string())),
            ("drop_filename", None) => Err(ParseFilterError::MissingValue(s.to_string())),
            (name, _) => Err(ParseFilterError::Unknown(name.to_string())),
        }
    }
}

/// Drop all execves with an empty filename.
pub fn default_filters() -> Vec<ExecveFilter> {
    vec![ExecveFilter::DropFilename(String::new())]
}

#[derive(Debug, Clone)]
pub struct ProcessObservationPoint {
    filters: FilterPipeline<ExecveFilter>,
}

impl ProcessObservationPoint {
    pub fn new(filters: Vec<ExecveFilter>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    /// Filters from the `filters` field, falling back to `default`.
    pub fn from_config(config: &ModuleConfig, default: Vec<ExecveFilter>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.get_list_with_default("filters", default)?))
    }
}

#[async_trait]
impl ObservationPoint for ProcessObservationPoint {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn tracepoints(&self) -> Vec<Tracepoint> {
        vec![TRACEPOINT]
    }

    async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
        let execve: ExecveRecord = decode(&record.payload)?;
        if let Some(filter) = self.filters.first_drop(&execve) {
            log::trace!(target: MODULE_NAME, "pid {} dropped by {filter:?}", execve.pid);
            return Ok(Disposition::Dropped);
        }
        Ok(Disposition::Emit(Event::new(
            record.cpu,
            Payload::ProcessExecuted {
                pid: execve.pid,
                filename: execve.filename(),
                comm: execve.comm(),
            },
        )))
    }
}
