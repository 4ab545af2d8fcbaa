//! `SocketState`: TCP-like sockets moving between states.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use async_trait::async_trait;
use bpf_common::{
    RawRecord, Tracepoint,
    parsing::{DecodeError, FixedLayout, RecordReader, decode},
};
use slit_core::{
    ConfigError, Disposition, Event, Filter, FilterPipeline, ModuleConfig, ObservationPoint,
    ParseFilterError, Payload, filter::split_filter, kernel::net::AF_INET6,
};

pub const MODULE_NAME: &str = "SocketState";

pub const TRACEPOINT: Tracepoint =
    Tracepoint::new("sock", "inet_sock_set_state", "inet_sock_set_state");

/// Record written by `inet_sock_set_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SocketStateRecord {
    pub old_state: i32,
    pub new_state: i32,
    pub source_port: u16,
    pub dest_port: u16,
    pub family: u16,
    pub protocol: u16,
    pub source_addr: [u8; 4],
    pub dest_addr: [u8; 4],
    pub source_addr_v6: [u8; 16],
    pub dest_addr_v6: [u8; 16],
}

impl FixedLayout for SocketStateRecord {
    const KIND: &'static str = "socket state";
    const SIZE: usize = 56;

    fn read(reader: &mut RecordReader<'_>) -> Self {
        Self {
            old_state: reader.i32(),
            new_state: reader.i32(),
            source_port: reader.u16(),
            dest_port: reader.u16(),
            family: reader.u16(),
            protocol: reader.u16(),
            source_addr: reader.array(),
            dest_addr: reader.array(),
            source_addr_v6: reader.array(),
            dest_addr_v6: reader.array(),
        }
    }
}

impl SocketStateRecord {
    /// Addresses in the representation matching the socket family.
    pub fn addresses(&self) -> (IpAddr, IpAddr) {
        if self.family == AF_INET6 {
            (
                Ipv6Addr::from(self.source_addr_v6).into(),
                Ipv6Addr::from(self.dest_addr_v6).into(),
            )
        } else {
            (
                Ipv4Addr::from(self.source_addr).into(),
                Ipv4Addr::from(self.dest_addr).into(),
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFilter {
    DropProtocolEq0,
}

impl Filter<SocketStateRecord> for SocketFilter {
    fn drops(&self, record: &SocketStateRecord) -> bool {
        match self {
            SocketFilter::DropProtocolEq0 => record.protocol == 0,
        }
    }
}

impl FromStr for SocketFilter {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_filter(s) {
            ("drop_protocol_eq0", None) => Ok(SocketFilter::DropProtocolEq0),
            ("drop_protocol_eq0", Some(value)) => Err(ParseFilterError::InvalidValue {
                filter: "drop_protocol_eq0".to_string(),
                value: value.to_string(),
                reason: "takes no value".to_string(),
            }),
            (name, _) => Err(ParseFilterError::Unknown(name.to_string())),
        }
    }
}

/// Drop all sockets where protocol is 0.
pub fn default_filters() -> Vec<SocketFilter> {
    vec![SocketFilter::DropProtocolEq0]
}

#[derive(Debug, Clone)]
pub struct SocketObservationPoint {
    filters: FilterPipeline<SocketFilter>,
}

impl SocketObservationPoint {
    pub fn new(filters: Vec<SocketFilter>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    pub fn from_config(config: &ModuleConfig, default: Vec<SocketFilter>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.get_list_with_default("filters", default)?))
    }
}

#[async_trait]
impl ObservationPoint for SocketObservationPoint {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn tracepoints(&self) -> Vec<Tracepoint> {
        vec![TRACEPOINT]
    }

    async fn handle(&self, record: &RawRecord) -> Result<Disposition, DecodeError> {
        let socket: SocketStateRecord = decode(&record.payload)?;
        if self.filters.first_drop(&socket).is_some() {
            return Ok(Disposition::Dropped);
        }
        let (source_addr, dest_addr) = socket.addresses();
        Ok(Disposition::Emit(Event::new(
            record.cpu,
            Payload::SocketStateChanged {
                old_state: socket.old_state,
                new_state: socket.new_state,
                source_port: socket.source_port,
                dest_port: socket.dest_port,
                family: socket.family,
                protocol: socket.protocol,
                source_addr,
                dest_addr,
            },
        )))
    }
}

#[cfg(test)]
mod test {
    use slit_core::kernel::{
        net::{AF_INET, IPPROTO_TCP},
        tcp::{TCP_ESTABLISHED, TCP_SYN_SENT},
    };

    use super::*;

    struct Socket {
        family: u16,
        protocol: u16,
        saddr: [u8; 4],
        daddr: [u8; 4],
        saddr_v6: [u8; 16],
        daddr_v6: [u8; 16],
    }

    impl Default for Socket {
        fn default() -> Self {
            Self {
                family: AF_INET,
                protocol: IPPROTO_TCP,
                saddr: [10, 0, 0, 1],
                daddr: [10, 0, 0, 2],
                saddr_v6: [0; 16],
                daddr_v6: [0; 16],
            }
        }
    }

    impl Socket {
        fn record(&self) -> RawRecord {
            let mut payload = Vec::new();
            payload.extend_from_slice(&TCP_SYN_SENT.to_le_bytes());
            payload.extend_from_slice(&TCP_ESTABLISHED.to_le_bytes());
            payload.extend_from_slice(&43210u16.to_le_bytes());
            payload.extend_from_slice(&443u16.to_le_bytes());
            payload.extend_from_slice(&self.family.to_le_bytes());
            payload.extend_from_slice(&self.protocol.to_le_bytes());
            payload.extend_from_slice(&self.saddr);
            payload.extend_from_slice(&self.daddr);
            payload.extend_from_slice(&self.saddr_v6);
            payload.extend_from_slice(&self.daddr_v6);
            RawRecord::new(0, payload)
        }
    }

    #[tokio::test]
    async fn protocol_zero_is_dropped_by_default() {
        let point = SocketObservationPoint::new(default_filters());
        let record = Socket {
            protocol: 0,
            ..Default::default()
        }
        .record();
        assert_eq!(point.handle(&record).await, Ok(Disposition::Dropped));
    }

    #[tokio::test]
    async fn tcp_ipv4_transition() {
        let point = SocketObservationPoint::new(default_filters());
        let Ok(Disposition::Emit(event)) = point.handle(&Socket::default().record()).await else {
            panic!("event expected");
        };
        let Payload::SocketStateChanged {
            old_state,
            new_state,
            source_port,
            dest_port,
            protocol,
            source_addr,
            dest_addr,
            ..
        } = &event.payload
        else {
            panic!("unexpected payload {event}");
        };
        assert_eq!((*old_state, *new_state), (TCP_SYN_SENT, TCP_ESTABLISHED));
        assert_eq!((*source_port, *dest_port), (43210, 443));
        assert_eq!(*protocol, IPPROTO_TCP);
        assert_eq!(source_addr.to_string(), "10.0.0.1");
        assert_eq!(dest_addr.to_string(), "10.0.0.2");

        let json: String = event.to_json().unwrap();
        assert!(json.contains(r#""source_addr":"10.0.0.1""#));
    }

    #[tokio::test]
    async fn ipv6_uses_the_v6_addresses() {
        let point = SocketObservationPoint::new(default_filters());
        let mut saddr_v6 = [0; 16];
        saddr_v6[15] = 1;
        let mut daddr_v6 = [0; 16];
        daddr_v6[..2].copy_from_slice(&[0xfe, 0x80]);
        daddr_v6[15] = 2;
        let record = Socket {
            family: AF_INET6,
            saddr_v6,
            daddr_v6,
            ..Default::default()
        }
        .record();
        let Ok(Disposition::Emit(event)) = point.handle(&record).await else {
            panic!("event expected");
        };
        let Payload::SocketStateChanged {
            source_addr,
            dest_addr,
            ..
        } = event.payload
        else {
            panic!("unexpected payload");
        };
        assert_eq!(source_addr.to_string(), "::1");
        assert_eq!(dest_addr.to_string(), "fe80::2");
    }

    #[tokio::test]
    async fn records_of_other_layouts_are_rejected() {
        let point = SocketObservationPoint::new(default_filters());
        let mut execve = 10u32.to_le_bytes().to_vec();
        execve.extend_from_slice(&[b'/'; 64]);
        let err = point.handle(&RawRecord::new(0, execve)).await.unwrap_err();
        assert_eq!((err.expected, err.actual), (SocketStateRecord::SIZE, 68));

        // Padded by perf to its 8 bytes alignment
        let mut record = Socket::default().record();
        let mut payload = record.payload.to_vec();
        payload.extend_from_slice(&[0; 4]);
        record.payload = payload.into();
        assert!(matches!(point.handle(&record).await, Ok(Disposition::Emit(_))));
    }

    #[test]
    fn filters_from_config() {
        let config: ModuleConfig = [("filters", "")].into_iter().collect();
        let point = SocketObservationPoint::from_config(&config, default_filters()).unwrap();
        assert!(point.filters.is_empty());
        let config: ModuleConfig = [("filters", "drop_protocol_eq0=6")].into_iter().collect();
        assert!(SocketObservationPoint::from_config(&config, default_filters()).is_err());
    }
}
