//! Terminal consumers of the event stream.

use std::io::{self, Write};

use crate::{bus::EventStream, event::Event};

/// Render an event as a single JSON line. A serialization failure is reported inline
/// so the stream is never interrupted.
pub fn json_line(event: &Event) -> String {
    match event.to_json() {
        Ok(json) => json,
        Err(err) => serde_json::json!({ "error": err.to_string() }).to_string(),
    }
}

/// Write one JSON object per line until the stream ends. Returns the number of
/// events written.
pub async fn print_json_events<W: Write>(events: EventStream, mut out: W) -> io::Result<u64> {
    let mut count = 0;
    while let Some(event) = events.recv().await {
        writeln!(out, "{}", json_line(&event))?;
        out.flush()?;
        count += 1;
    }
    Ok(count)
}

/// Log a human readable line per event until the stream ends.
pub async fn log_events(events: EventStream) -> u64 {
    let mut count = 0;
    while let Some(event) = events.recv().await {
        log::info!(target: event.name(), "{event}");
        count += 1;
    }
    count
}
