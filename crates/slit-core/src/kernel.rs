//! Symbolic values used by the `sock/inet_sock_set_state` tracepoint.

pub mod tcp {
    pub const TCP_ESTABLISHED: i32 = 1;
    pub const TCP_SYN_SENT: i32 = 2;
    pub const TCP_SYN_RECV: i32 = 3;
    pub const TCP_FIN_WAIT1: i32 = 4;
    pub const TCP_FIN_WAIT2: i32 = 5;
    pub const TCP_TIME_WAIT: i32 = 6;
    pub const TCP_CLOSE: i32 = 7;
    pub const TCP_CLOSE_WAIT: i32 = 8;
    pub const TCP_LAST_ACK: i32 = 9;
    pub const TCP_LISTEN: i32 = 10;
    pub const TCP_CLOSING: i32 = 11;
    pub const TCP_NEW_SYN_RECV: i32 = 12;

    const STATES: [(&str, i32); 12] = [
        ("TCP_ESTABLISHED", TCP_ESTABLISHED),
        ("TCP_SYN_SENT", TCP_SYN_SENT),
        ("TCP_SYN_RECV", TCP_SYN_RECV),
        ("TCP_FIN_WAIT1", TCP_FIN_WAIT1),
        ("TCP_FIN_WAIT2", TCP_FIN_WAIT2),
        ("TCP_TIME_WAIT", TCP_TIME_WAIT),
        ("TCP_CLOSE", TCP_CLOSE),
        ("TCP_CLOSE_WAIT", TCP_CLOSE_WAIT),
        ("TCP_LAST_ACK", TCP_LAST_ACK),
        ("TCP_LISTEN", TCP_LISTEN),
        ("TCP_CLOSING", TCP_CLOSING),
        ("TCP_NEW_SYN_RECV", TCP_NEW_SYN_RECV),
    ];

    pub fn state_name(state: i32) -> Option<&'static str> {
        STATES
            .iter()
            .find(|(_, value)| *value == state)
            .map(|(name, _)| *name)
    }
}

pub mod net {
    pub const AF_INET: u16 = 2;
    pub const AF_INET6: u16 = 10;

    pub const IPPROTO_TCP: u16 = 6;
    pub const IPPROTO_DCCP: u16 = 33;
    pub const IPPROTO_SCTP: u16 = 132;
    pub const IPPROTO_MPTCP: u16 = 262;

    pub fn family_name(family: u16) -> Option<&'static str> {
        match family {
            AF_INET => Some("AF_INET"),
            AF_INET6 => Some("AF_INET6"),
            _ => None,
        }
    }

    pub fn protocol_name(protocol: u16) -> Option<&'static str> {
        match protocol {
            IPPROTO_TCP => Some("IPPROTO_TCP"),
            IPPROTO_DCCP => Some("IPPROTO_DCCP"),
            IPPROTO_SCTP => Some("IPPROTO_SCTP"),
            IPPROTO_MPTCP => Some("IPPROTO_MPTCP"),
            _ => None,
        }
    }
}
