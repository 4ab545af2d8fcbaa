use bpf_common::LoaderError;
use thiserror::Error;

use crate::observer::ObserverState;

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("insufficient privileges, you must run this as root user")]
    NotPrivileged,
    #[error("preparing the instrumentation")]
    Setup(#[source] LoaderError),
    #[error("attaching {tracepoint}")]
    Attach {
        tracepoint: String,
        #[source]
        source: LoaderError,
    },
    #[error("opening ring buffer {map}")]
    RingBufferOpen {
        map: String,
        #[source]
        source: LoaderError,
    },
    #[error("closing ring buffer")]
    RingBufferClose(#[source] LoaderError),
    #[error("operation not allowed in state {0}")]
    InvalidState(ObserverState),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("observation point {0} registered twice")]
    Duplicate(String),
}
