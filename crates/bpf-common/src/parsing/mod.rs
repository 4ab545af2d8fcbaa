pub mod procfs;
pub mod record;

pub use record::{DecodeError, FixedLayout, RecordReader, c_string, decode};
