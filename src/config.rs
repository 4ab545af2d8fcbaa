use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use bpf_common::program::perf_pages_or_default;
use slit_core::{ModuleConfig, ObserverOptions, observer::RING_BUFFER_DEFAULT};
use strum::{Display, EnumString};

const DEFAULT_CONFIG_FILE: &str = "/etc/slit/slit.ini";

/// Section for settings shared by every observation point.
pub const GENERAL_SECTION: &str = "slit";

pub const DEFAULT_PROBE: &str = "/usr/lib/slit/probe.bpf.o";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum ProfileName {
    #[default]
    Default,
    SignalsOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Output {
    /// One JSON object per line on stdout
    #[default]
    Json,
    /// Human readable lines through the logger
    Log,
}

/// Slit configuration, one [`ModuleConfig`] per INI section.
///
/// Parsed once at startup and never modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct SlitConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl SlitConfig {
    /// Load the default file. A missing file is an empty configuration.
    pub fn new() -> Result<Self> {
        let config_file = Path::new(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: &Path) -> Result<Self> {
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    pub fn from_ini_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key, value);
                }
            }
        }
        Self { configs }
    }

    /// Configuration of a section, empty if absent.
    pub fn get_module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }

    pub fn general(&self) -> Result<GeneralConfig> {
        GeneralConfig::try_from(&self.get_module_config(GENERAL_SECTION))
            .with_context(|| format!("Invalid [{GENERAL_SECTION}] section"))
    }
}

/// Settings of the `[slit]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralConfig {
    pub profile: ProfileName,
    pub probe: PathBuf,
    pub output: Output,
    pub ring_buffer: String,
    pub perf_pages: usize,
}

impl GeneralConfig {
    pub fn observer_options(&self) -> ObserverOptions {
        ObserverOptions {
            ring_buffer: self.ring_buffer.clone(),
            perf_pages: self.perf_pages,
        }
    }
}

impl TryFrom<&ModuleConfig> for GeneralConfig {
    type Error = slit_core::ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let defaults = ObserverOptions::default();
        Ok(Self {
            profile: config.with_default("profile", ProfileName::default())?,
            probe: config.with_default("probe", PathBuf::from(DEFAULT_PROBE))?,
            output: config.with_default("output", Output::default())?,
            ring_buffer: config.with_default("ring_buffer", RING_BUFFER_DEFAULT.to_string())?,
            perf_pages: perf_pages_or_default(config.with_default("perf_pages", defaults.perf_pages)?),
        })
    }
}
