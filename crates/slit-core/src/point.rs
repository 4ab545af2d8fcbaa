use async_trait::async_trait;
use bpf_common::{RawRecord, Tracepoint, parsing::DecodeError};

use crate::event::Event;

/// Outcome of handing a record to an [`ObservationPoint`].
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The record passed every filter.
    Emit(Event),
    /// A filter claimed the record. Not a failure.
    Dropped,
}

/// Unit of decode, filter and transform for one event kind.
///
/// Points are built once from an immutable filter configuration and never change
/// afterwards. The observer hands them every record read from the ring buffer, so
/// a payload with a foreign layout is routine and reported as [`DecodeError`].
#[async_trait]
pub trait ObservationPoint: Send + Sync + 'static {
    /// Stable name, unique inside a profile
    fn name(&self) -> &'static str;

    /// Tracepoints to attach before this point can receive records.
    fn tracepoints(&self) -> Vec<Tracepoint>;

    /// Decode the record, run the filters and build the event.
    async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError>;
}
