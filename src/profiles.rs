//! Sets of observation points the observer can run with.
//!
//! Every point reads its own section of the configuration: `enabled = false` leaves
//! it out, `filters` replaces the profile's defaults.

use anyhow::{Context, Result};
use bpf_common::parsing::procfs::ProcessLookup;
use container_monitor::ContainerObservationPoint;
use process_monitor::ProcessObservationPoint;
use signal_monitor::SignalObservationPoint;
use slit_core::{ModuleConfig, Profile};
use socket_monitor::SocketObservationPoint;

use crate::config::{ProfileName, SlitConfig};

pub fn build_profile(
    name: ProfileName,
    config: &SlitConfig,
    lookup: impl ProcessLookup,
) -> Result<Profile> {
    let profile = match name {
        ProfileName::Default => default_profile(config, lookup),
        ProfileName::SignalsOnly => signals_only(config),
    }
    .with_context(|| format!("Error building profile {name}"))?;
    log::debug!("{profile:?}");
    Ok(profile)
}

/// Process executions, container starts, signal deliveries and socket state changes.
pub fn default_profile(config: &SlitConfig, lookup: impl ProcessLookup) -> Result<Profile> {
    let mut profile = Profile::new(ProfileName::Default.to_string());

    if let Some(section) = enabled(config, process_monitor::MODULE_NAME)? {
        profile.add(ProcessObservationPoint::from_config(
            &section,
            process_monitor::default_filters(),
        )?)?;
    }
    if let Some(section) = enabled(config, container_monitor::MODULE_NAME)? {
        profile.add(ContainerObservationPoint::from_config(
            &section,
            container_monitor::default_filters(),
            container_monitor::default_process_filters(),
            lookup,
        )?)?;
    }
    if let Some(section) = enabled(config, signal_monitor::MODULE_NAME)? {
        profile.add(SignalObservationPoint::from_config(
            &section,
            signal_monitor::default_filters(),
        )?)?;
    }
    if let Some(section) = enabled(config, socket_monitor::MODULE_NAME)? {
        profile.add(SocketObservationPoint::from_config(
            &section,
            socket_monitor::default_filters(),
        )?)?;
    }

    Ok(profile)
}

/// Every delivered signal, unfiltered unless configured otherwise.
pub fn signals_only(config: &SlitConfig) -> Result<Profile> {
    let mut profile = Profile::new(ProfileName::SignalsOnly.to_string());
    if let Some(section) = enabled(config, signal_monitor::MODULE_NAME)? {
        profile.add(SignalObservationPoint::from_config(&section, Vec::new())?)?;
    }
    Ok(profile)
}

/// Section of an observation point, or `None` when it's disabled.
fn enabled(config: &SlitConfig, module: &str) -> Result<Option<ModuleConfig>> {
    let section = config.get_module_config(module);
    let enabled = section
        .with_default("enabled", true)
        .with_context(|| format!("Invalid [{module}] section"))?;
    if !enabled {
        log::info!("{module} disabled by configuration");
        return Ok(None);
    }
    Ok(Some(section))
}
