use std::{fmt, net::IpAddr};

use bpf_common::parsing::procfs::ProcessMetadata;
use serde::Serialize;
use strum::{EnumDiscriminants, EnumString, IntoStaticStr};

use crate::kernel::{net, tcp};

/// A fully formed event, produced by an observation point from a single record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// CPU the record was captured on
    pub cpu: u32,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Event {
    pub fn new(cpu: u32, payload: Payload) -> Self {
        Self { cpu, payload }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from(&self.payload)
    }

    /// Stable name of the event kind, as found in the `name` field of the JSON output.
    pub fn name(&self) -> &'static str {
        self.kind().into()
    }

    /// Single line JSON object with every field of the event.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, EnumDiscriminants)]
#[serde(tag = "name")]
#[strum_discriminants(derive(strum::Display, EnumString, IntoStaticStr, Hash))]
#[strum_discriminants(name(EventKind))]
pub enum Payload {
    ProcessExecuted {
        pid: u32,
        filename: String,
        comm: String,
    },
    ContainerStarted {
        parent_pid: u32,
        child_pid: u32,
        clone_flags: u64,
        /// Missing when the process already exited
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<ProcessMetadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        child: Option<ProcessMetadata>,
        flag_names: Vec<&'static str>,
    },
    SignalDelivered {
        signal: i32,
        errno: i32,
        code: i32,
        handler: u64,
        flags: u64,
    },
    SocketStateChanged {
        old_state: i32,
        new_state: i32,
        source_port: u16,
        dest_port: u16,
        family: u16,
        protocol: u16,
        source_addr: IpAddr,
        dest_addr: IpAddr,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = self.cpu;
        match &self.payload {
            Payload::ProcessExecuted {
                pid,
                filename,
                comm,
            } => write!(f, "[{comm}] ({pid}) (CPU: {cpu}): {filename}"),
            Payload::ContainerStarted {
                parent_pid,
                child_pid,
                clone_flags,
                parent,
                child,
                flag_names,
            } => {
                write!(
                    f,
                    "[CPU {cpu}] Parent({parent_pid}) -> Child({child_pid}) [{clone_flags:#x}] ({})",
                    flag_names.join(",")
                )?;
                if let Some(parent) = parent {
                    write!(f, " parent: {}", parent.executable)?;
                }
                if let Some(child) = child {
                    write!(f, " child: {}", child.executable)?;
                }
                Ok(())
            }
            Payload::SignalDelivered {
                signal,
                errno,
                code,
                handler,
                flags,
            } => write!(
                f,
                "[CPU {cpu}] Signal {signal} {{ code: {code}, errno: {errno}, handler: {handler:#x}, flags: {flags:#x} }}"
            ),
            Payload::SocketStateChanged {
                old_state,
                new_state,
                source_port,
                dest_port,
                family,
                protocol,
                source_addr,
                dest_addr,
            } => write!(
                f,
                "[CPU {cpu}] {} {} {} -> {} {} -> {}",
                Symbol(net::family_name(*family), *family),
                Symbol(net::protocol_name(*protocol), *protocol),
                Host(source_addr, *source_port),
                Host(dest_addr, *dest_port),
                Symbol(tcp::state_name(*old_state), *old_state),
                Symbol(tcp::state_name(*new_state), *new_state),
            ),
        }
    }
}

/// Symbolic name of a kernel value, falling back to the raw number.
struct Symbol<T>(Option<&'static str>, T);

impl<T: fmt::Display> fmt::Display for Symbol<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.1),
        }
    }
}

struct Host<'a>(&'a IpAddr, u16);

impl fmt::Display for Host<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IpAddr::V4(v4) => write!(f, "{v4}:{}", self.1),
            IpAddr::V6(v6) => write!(f, "[{v6}]:{}", self.1),
        }
    }
}
