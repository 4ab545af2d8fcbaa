use std::time::Duration;

use crate::event::Event;

/// Outbound event channel: unbounded, many writers and many readers.
///
/// Readers compete for events, every event is delivered to exactly one of them.
/// Writers never block.
#[derive(Clone)]
pub struct Bus {
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn send(&self, event: Event) {
        log::trace!(target: &format!("event::{}", event.name()), "{event:?}");

        // The bus holds a receiver, the channel can't be disconnected.
        let _ = self.tx.send(event);
    }

    /// A new reader over the channel.
    pub fn stream(&self) -> EventStream {
        EventStream {
            rx: self.rx.clone(),
        }
    }

    /// Events sent and not yet received by any reader.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side of the [`Bus`]. Every method returns `None` once the observer has
/// stopped and the remaining events were drained.
#[derive(Clone)]
pub struct EventStream {
    rx: flume::Receiver<Event>,
}

impl EventStream {
    /// Block the current thread until an event is available.
    pub fn next_event(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    /// Like [`EventStream::next_event`], giving up after `timeout`.
    pub fn next_event_timeout(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub async fn recv(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for EventStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.next_event()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::Payload;

    fn signal(signal: i32) -> Event {
        Event::new(
            0,
            Payload::SignalDelivered {
                signal,
                errno: 0,
                code: 0,
                handler: 0,
                flags: 0,
            },
        )
    }

    #[test]
    fn events_are_read_in_delivery_order() {
        let bus = Bus::new();
        let stream = bus.stream();
        for n in 1..=3 {
            bus.send(signal(n));
        }
        assert_eq!(bus.pending(), 3);
        let signals: Vec<_> = std::iter::from_fn(|| stream.try_next())
            .map(|event| match event.payload {
                Payload::SignalDelivered { signal, .. } => signal,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(signals, vec![1, 2, 3]);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn every_event_reaches_one_reader() {
        let bus = Bus::new();
        let (a, b) = (bus.stream(), bus.stream());
        bus.send(signal(1));
        bus.send(signal(2));
        assert!(a.try_next().is_some());
        assert!(b.try_next().is_some());
        assert!(a.try_next().is_none());
        assert!(b.try_next().is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_bus_is_gone() {
        let bus = Bus::new();
        let stream = bus.stream();
        bus.send(signal(9));
        drop(bus);
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
        assert!(stream.next_event_timeout(Duration::from_millis(10)).is_none());
    }
}
