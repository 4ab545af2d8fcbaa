//! `SignalDelivered`: signals delivered to a process, with the handler they run.

use std::str::FromStr;

use async_trait::async_trait;
use bpf_common::{
    RawRecord, Tracepoint,
    parsing::{DecodeError, FixedLayout, RecordReader, decode},
};
use slit_core::{
    ConfigError, Disposition, Event, Filter, FilterPipeline, ModuleConfig, ObservationPoint,
    ParseFilterError, Payload, filter::split_filter,
};

pub const MODULE_NAME: &str = "SignalDelivered";

pub const TRACEPOINT: Tracepoint = Tracepoint::new("signal", "signal_deliver", "signal_deliver");

/// Record written by `signal_deliver`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SignalRecord {
    pub signal: i32,
    pub errno: i32,
    pub code: i32,
    // 4 bytes of padding
    pub handler: u64,
    pub flags: u64,
}

impl FixedLayout for SignalRecord {
    const KIND: &'static str = "signal";
    const SIZE: usize = 32;

    fn read(reader: &mut RecordReader<'_>) -> Self {
        let signal = reader.i32();
        let errno = reader.i32();
        let code = reader.i32();
        reader.pad(4);
        Self {
            signal,
            errno,
            code,
            handler: reader.u64(),
            flags: reader.u64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFilter {
    DropFlagsEq0,
    DropCodeEq0,
}

impl Filter<SignalRecord> for SignalFilter {
    fn drops(&self, record: &SignalRecord) -> bool {
        match self {
            SignalFilter::DropFlagsEq0 => record.flags == 0,
            SignalFilter::DropCodeEq0 => record.code == 0,
        }
    }
}

impl FromStr for SignalFilter {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_filter(s) {
            ("drop_flags_eq0", None) => Ok(SignalFilter::DropFlagsEq0),
            ("drop_code_eq0", None) => Ok(SignalFilter::DropCodeEq0),
            (name @ ("drop_flags_eq0" | "drop_code_eq0"), Some(value)) => {
                Err(ParseFilterError::InvalidValue {
                    filter: name.to_string(),
                    value: value.to_string(),
                    reason: "takes no value".to_string(),
                })
            }
            (name, _) => Err(ParseFilterError::Unknown(name.to_string())),
        }
    }
}

/// Drop signals without flags or code.
pub fn default_filters() -> Vec<SignalFilter> {
    vec![SignalFilter::DropFlagsEq0, SignalFilter::DropCodeEq0]
}

#[derive(Debug, Clone)]
pub struct SignalObservationPoint {
    filters: FilterPipeline<SignalFilter>,
}

impl SignalObservationPoint {
    pub fn new(filters: Vec<SignalFilter>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    pub fn from_config(config: &ModuleConfig, default: Vec<SignalFilter>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.get_list_with_default("filters", default)?))
    }
}

#[async_trait]
impl ObservationPoint for SignalObservationPoint {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn tracepoints(&self) -> Vec<Tracepoint> {
        vec![TRACEPOINT]
    }

    async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
        let signal: SignalRecord = decode(&record.payload)?;
        if self.filters.first_drop(&signal).is_some() {
            return Ok(Disposition::Dropped);
        }
        Ok(Disposition::Emit(Event::new(
            record.cpu,
            Payload::SignalDelivered {
                signal: signal.signal,
                errno: signal.errno,
                code: signal.code,
                handler: signal.handler,
                flags: signal.flags,
            },
        )))
    }
}
