use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{Output, ProfileName};

pub const NAME: &str = "slit";

#[derive(Parser, Debug, Clone)]
#[command(name = NAME, version, about = "Kernel event observer powered by eBPF")]
pub struct SlitOpts {
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file, defaults to /etc/slit/slit.ini
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream kernel events until interrupted (default)
    Observe(ObserveOpts),
    /// Check privileges and raise the memlock limit, then exit
    Check,
    /// Decode a clone flags mask
    Flags {
        /// `|` joined flag names, hexadecimal (0x) or decimal value
        value: String,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Observe(ObserveOpts::default())
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ObserveOpts {
    /// Set of observation points to enable
    #[arg(long, value_enum)]
    pub profile: Option<ProfileName>,

    /// Event output format
    #[arg(long, value_enum)]
    pub output: Option<Output>,

    /// Compiled instrumentation artifact
    #[arg(long)]
    pub probe: Option<PathBuf>,
}

impl SlitOpts {
    pub fn override_log_level(&self) -> log::Level {
        log_level_from_verbosity_flag_count(self.verbose)
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or_default()
    }
}

pub fn parse_from_args() -> SlitOpts {
    parse_from(&mut env::args_os())
}

pub fn parse_from<I, T>(args: I) -> SlitOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    SlitOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    matches!(env::var("RUST_BACKTRACE").as_deref(), Ok("1"))
}

/// Log an error with its whole chain of causes, and the backtrace when debugging.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
