//! Slit streams kernel activity observed through eBPF tracepoints.
//!
//! A single consumer loop reads the ring buffer the probes write to and hands every
//! record to the observation points of the active profile:
//!
//! - `ProcessExecuted`: every `execve`
//! - `ContainerStarted`: clones creating new namespaces, with both processes resolved
//! - `SignalDelivered`: signal deliveries
//! - `SocketState`: TCP-like socket state transitions
//!
//! Events are printed as JSON lines (default) or logged in a human readable form
//! until SIGINT, SIGTERM or SIGQUIT:
//!
//! ```sh
//! slit observe --profile default --output json
//! ```
//!
//! Every section of the INI configuration (`/etc/slit/slit.ini` by default) is named
//! after an observation point and can disable it or replace its filters.

use std::io::{self, Write};

use anyhow::{Context, Result};
use bpf_common::{AyaLoader, ProbeLoader, parsing::procfs::Procfs};
use container_monitor::flags::{CloneFlags, flag_names, parse_flags};
use slit_core::{
    Observer, ShutdownReport, ShutdownSignal, preflight,
    shutdown::on_termination_signals,
    sink::{log_events, print_json_events},
};

use crate::{
    cli::{Command, ObserveOpts, SlitOpts},
    config::{Output, SlitConfig},
};

pub mod cli;
pub mod config;
pub mod profiles;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder()
            .filter_level(override_log_level.to_level_filter())
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}

pub async fn slit_run(options: &SlitOpts) -> Result<()> {
    log::debug!("slit {}", metadata::VERSION);
    log::trace!("Slit Options: {:?}", options);

    let config = if let Some(custom_file) = &options.config_file {
        SlitConfig::with_custom_file(custom_file)?
    } else {
        SlitConfig::new()?
    };

    match options.command() {
        Command::Observe(observe_opts) => observe(&observe_opts, &config).await,
        Command::Check => check(&config),
        Command::Flags { value } => print_flags(&value),
    }
}

async fn observe(options: &ObserveOpts, config: &SlitConfig) -> Result<()> {
    let general = config.general()?;
    let profile_name = options.profile.unwrap_or(general.profile);
    let output = options.output.unwrap_or(general.output);
    let probe = options.probe.clone().unwrap_or_else(|| general.probe.clone());

    let profile = profiles::build_profile(profile_name, config, Procfs::default())?;

    let loader = AyaLoader::new(probe);
    preflight(&loader).context("Preflight failed")?;

    let shutdown = on_termination_signals().context("Error installing signal handlers")?;
    let observer = Observer::new(loader, profile, general.observer_options());

    run_observer(observer, output, io::stdout(), shutdown).await?;
    Ok(())
}

/// Run `observer` until `shutdown` fires, draining its events into the `output` sink.
///
/// JSON lines are written to `out`. Fails if the observer can't start or its ring
/// buffer can't be closed; link release failures are only reported.
pub async fn run_observer<L: ProbeLoader, W: Write>(
    observer: Observer<L>,
    output: Output,
    out: W,
    shutdown: ShutdownSignal,
) -> Result<ShutdownReport> {
    let events = observer.events();
    let sink = async move {
        match output {
            Output::Json => print_json_events(events, out).await,
            Output::Log => Ok(log_events(events).await),
        }
    };

    let (report, written) = tokio::join!(observer.run(shutdown), sink);
    let report = report.context("Observer failed")?;
    let written = written.context("Error writing events")?;

    log::info!(
        "Stopped after {} events ({:?})",
        written,
        report.stats
    );
    if !report.release_failures.is_empty() {
        log::warn!(
            "{} of {} tracepoints could not be released: {}",
            report.release_failures.len(),
            report.released,
            report.release_failures.join(", ")
        );
    }
    Ok(report)
}

fn check(config: &SlitConfig) -> Result<()> {
    let general = config.general()?;
    preflight(&AyaLoader::new(&general.probe)).context("Preflight failed")?;
    println!("Ready to load {}", general.probe.display());
    Ok(())
}

fn print_flags(value: &str) -> Result<()> {
    let flags = parse_flags(value)?;
    println!("value: {flags:#x}");
    println!("set: {}", CloneFlags(flags));
    println!("flag_names: {}", flag_names(flags).join(", "));
    Ok(())
}
