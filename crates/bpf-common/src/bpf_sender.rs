//! The [`RecordSender`] trait is used by the per-CPU ring buffer readers to forward
//! records and read errors to the single consumer.
//!
//! [`RecordSender::send`] must not block since it is called from async contexts.

use tokio::sync::mpsc;

use crate::loader::{LoaderError, RawRecord};

pub trait RecordSender: Clone + Send + 'static {
    /// Must not block since it can be used in async contexts.
    /// Returns false when the receiving side is gone.
    fn send(&mut self, data: Result<RawRecord, LoaderError>) -> bool;
}

/// Unbounded tokio channel: the kernel side is never throttled by userspace, overflow
/// is reported by the ring buffer itself as lost samples.
impl RecordSender for mpsc::UnboundedSender<Result<RawRecord, LoaderError>> {
    fn send(&mut self, data: Result<RawRecord, LoaderError>) -> bool {
        mpsc::UnboundedSender::send(self, data).is_ok()
    }
}

/// RecordSenderWrapper wraps a RecordSender with a new one which calls
/// a callback on every record forwarded. Useful to keep counters on the reader side.
#[derive(Clone)]
pub struct RecordSenderWrapper<S, F> {
    cb: F,
    inner: S,
}

impl<S, F> RecordSenderWrapper<S, F> {
    pub fn new(inner: S, cb: F) -> Self {
        Self { inner, cb }
    }
}

impl<S, F> RecordSender for RecordSenderWrapper<S, F>
where
    S: RecordSender,
    F: FnMut(&RawRecord) + Clone + Send + 'static,
{
    fn send(&mut self, data: Result<RawRecord, LoaderError>) -> bool {
        if let Ok(record) = &data {
            (self.cb)(record);
        }
        self.inner.send(data)
    }
}
