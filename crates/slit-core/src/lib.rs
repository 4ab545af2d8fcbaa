//! Core of the slit observer.
//!
//! Raw records read from the kernel ring buffer are handed to every
//! [`ObservationPoint`] of the active [`Profile`]. Points decode them, run their
//! [`FilterPipeline`] and emit typed [`Event`]s on the outbound [`Bus`], where
//! [`sink`]s or programmatic readers pick them up.
//!
//! The [`Observer`] owns the whole pipeline and the kernel resources behind it.

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod kernel;
pub mod observer;
pub mod point;
pub mod profile;
pub mod shutdown;
pub mod sink;

pub use bus::{Bus, EventStream};
pub use config::{ConfigError, ModuleConfig};
pub use error::{ObserverError, ProfileError};
pub use event::{Event, EventKind, Payload};
pub use filter::{Filter, FilterPipeline, ParseFilterError};
pub use observer::{
    Observer, ObserverOptions, ObserverState, ObserverStats, ShutdownReport, StatsSnapshot,
    preflight,
};
pub use point::{Disposition, ObservationPoint};
pub use profile::Profile;
pub use shutdown::{ShutdownSender, ShutdownSignal};
