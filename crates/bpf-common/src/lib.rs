mod bpf_sender;
pub mod loader;
pub mod parsing;
pub mod preflight;
pub mod program;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use bpf_sender::{RecordSender, RecordSenderWrapper};
pub use loader::{
    LoaderError, ProbeLoader, RawRecord, RecordSource, Tracepoint, TracepointLink,
};
pub use program::{AyaLoader, PERF_PAGES_DEFAULT};

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;
