//! Clone flags, as defined by the Linux UAPI header `linux/sched.h`.
//!
//! The table matches kernel ABI 5.2 and later, the first release defining
//! `CLONE_PIDFD`. Values are part of the syscall ABI and never change.

use std::fmt;

use thiserror::Error;

/// Signal mask to be sent at exit
pub const CSIGNAL: u64 = 0x0000_00ff;
pub const CLONE_VM: u64 = 0x0000_0100;
pub const CLONE_FS: u64 = 0x0000_0200;
pub const CLONE_FILES: u64 = 0x0000_0400;
pub const CLONE_SIGHAND: u64 = 0x0000_0800;
pub const CLONE_PIDFD: u64 = 0x0000_1000;
pub const CLONE_PTRACE: u64 = 0x0000_2000;
pub const CLONE_VFORK: u64 = 0x0000_4000;
pub const CLONE_PARENT: u64 = 0x0000_8000;
pub const CLONE_THREAD: u64 = 0x0001_0000;
pub const CLONE_NEWNS: u64 = 0x0002_0000;
pub const CLONE_SYSVSEM: u64 = 0x0004_0000;
pub const CLONE_SETTLS: u64 = 0x0008_0000;
pub const CLONE_PARENT_SETTID: u64 = 0x0010_0000;
pub const CLONE_CHILD_CLEARTID: u64 = 0x0020_0000;
/// Unused, ignored
pub const CLONE_DETACHED: u64 = 0x0040_0000;
pub const CLONE_UNTRACED: u64 = 0x0080_0000;
pub const CLONE_CHILD_SETTID: u64 = 0x0100_0000;
pub const CLONE_NEWCGROUP: u64 = 0x0200_0000;
pub const CLONE_NEWUTS: u64 = 0x0400_0000;
pub const CLONE_NEWIPC: u64 = 0x0800_0000;
pub const CLONE_NEWUSER: u64 = 0x1000_0000;
pub const CLONE_NEWPID: u64 = 0x2000_0000;
pub const CLONE_NEWNET: u64 = 0x4000_0000;
pub const CLONE_IO: u64 = 0x8000_0000;

/// Every named flag, in bit order. `CSIGNAL` is a mask and isn't listed.
pub const CLONE_FLAGS: [(&str, u64); 24] = [
    ("CLONE_VM", CLONE_VM),
    ("CLONE_FS", CLONE_FS),
    ("CLONE_FILES", CLONE_FILES),
    ("CLONE_SIGHAND", CLONE_SIGHAND),
    ("CLONE_PIDFD", CLONE_PIDFD),
    ("CLONE_PTRACE", CLONE_PTRACE),
    ("CLONE_VFORK", CLONE_VFORK),
    ("CLONE_PARENT", CLONE_PARENT),
    ("CLONE_THREAD", CLONE_THREAD),
    ("CLONE_NEWNS", CLONE_NEWNS),
    ("CLONE_SYSVSEM", CLONE_SYSVSEM),
    ("CLONE_SETTLS", CLONE_SETTLS),
    ("CLONE_PARENT_SETTID", CLONE_PARENT_SETTID),
    ("CLONE_CHILD_CLEARTID", CLONE_CHILD_CLEARTID),
    ("CLONE_DETACHED", CLONE_DETACHED),
    ("CLONE_UNTRACED", CLONE_UNTRACED),
    ("CLONE_CHILD_SETTID", CLONE_CHILD_SETTID),
    ("CLONE_NEWCGROUP", CLONE_NEWCGROUP),
    ("CLONE_NEWUTS", CLONE_NEWUTS),
    ("CLONE_NEWIPC", CLONE_NEWIPC),
    ("CLONE_NEWUSER", CLONE_NEWUSER),
    ("CLONE_NEWPID", CLONE_NEWPID),
    ("CLONE_NEWNET", CLONE_NEWNET),
    ("CLONE_IO", CLONE_IO),
];

/// Flag names reported on `ContainerStarted` events.
///
/// A name is listed when its bit is NOT set. This looks like an inverted condition
/// and is suspect, but it is kept as is: consumers depend on this polarity, so the
/// names describe the namespaces a clone did NOT create.
pub fn flag_names(flags: u64) -> Vec<&'static str> {
    CLONE_FLAGS
        .iter()
        .filter(|(_, bit)| flags & bit == 0)
        .map(|(name, _)| *name)
        .collect()
}

/// Names of the flags actually set in `flags`.
pub fn set_flags(flags: u64) -> Vec<&'static str> {
    CLONE_FLAGS
        .iter()
        .filter(|(_, bit)| flags & bit != 0)
        .map(|(name, _)| *name)
        .collect()
}

pub fn flag_value(name: &str) -> Option<u64> {
    CLONE_FLAGS
        .iter()
        .find(|(flag, _)| *flag == name)
        .map(|(_, bit)| *bit)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFlagsError {
    #[error("unknown clone flag {0}")]
    UnknownFlag(String),
    #[error("invalid clone flags literal {0}")]
    InvalidLiteral(String),
}

/// Parse a flag mask: `|` joined flag names, or a hexadecimal (`0x`) or decimal literal.
pub fn parse_flags(s: &str) -> Result<u64, ParseFlagsError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| ParseFlagsError::InvalidLiteral(s.to_string()));
    }
    if s.starts_with(|c: char| c.is_ascii_digit()) {
        return s
            .parse()
            .map_err(|_| ParseFlagsError::InvalidLiteral(s.to_string()));
    }
    s.split('|').map(str::trim).try_fold(0, |mask, name| {
        flag_value(name)
            .map(|bit| mask | bit)
            .ok_or_else(|| ParseFlagsError::UnknownFlag(name.to_string()))
    })
}

/// Displays a mask as `|` joined flag names, plus whatever bits have no name.
pub struct CloneFlags(pub u64);

impl fmt::Display for CloneFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = set_flags(self.0).join("|");
        let unnamed = self.0 & CLONE_FLAGS.iter().fold(u64::MAX, |rest, (_, bit)| rest & !bit);
        if unnamed != 0 {
            if !names.is_empty() {
                names.push('|');
            }
            names.push_str(&format!("{unnamed:#x}"));
        }
        if names.is_empty() {
            write!(f, "0")
        } else {
            write!(f, "{names}")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_is_in_bit_order() {
        assert!(CLONE_FLAGS.windows(2).all(|pair| pair[0].1 < pair[1].1));
        assert!(CLONE_FLAGS.iter().all(|(_, bit)| bit.is_power_of_two()));
        assert_eq!(CLONE_FLAGS.iter().fold(0, |mask, (_, bit)| mask | bit), 0xffff_ff00);
    }

    #[test]
    fn names_are_listed_for_absent_bits() {
        assert_eq!(flag_names(0).len(), CLONE_FLAGS.len());
        assert!(flag_names(0xffff_ffff).is_empty());

        let names = flag_names(CLONE_VM | CLONE_VFORK);
        assert!(!names.contains(&"CLONE_VM"));
        assert!(!names.contains(&"CLONE_VFORK"));
        assert!(names.contains(&"CLONE_FS"));
        assert_eq!(names.len(), CLONE_FLAGS.len() - 2);

        // Every single bit: its name is the only one missing
        for (name, bit) in CLONE_FLAGS {
            let names = flag_names(bit);
            assert!(!names.contains(&name));
            assert_eq!(names.len(), CLONE_FLAGS.len() - 1);
        }
    }

    #[test]
    fn parse_names_and_literals() {
        assert_eq!(parse_flags("CLONE_VFORK"), Ok(CLONE_VFORK));
        assert_eq!(
            parse_flags("CLONE_PIDFD | CLONE_SYSVSEM"),
            Ok(CLONE_PIDFD | CLONE_SYSVSEM)
        );
        assert_eq!(parse_flags("0x4000"), Ok(CLONE_VFORK));
        assert_eq!(parse_flags("16384"), Ok(CLONE_VFORK));
        assert_eq!(
            parse_flags("CLONE_NOPE"),
            Err(ParseFlagsError::UnknownFlag("CLONE_NOPE".to_string()))
        );
        assert!(parse_flags("0xzz").is_err());
        assert!(parse_flags("").is_err());
    }

    #[test]
    fn display_set_flags() {
        assert_eq!(CloneFlags(CLONE_VM | CLONE_FS).to_string(), "CLONE_VM|CLONE_FS");
        assert_eq!(CloneFlags(CLONE_VM | 0x11).to_string(), "CLONE_VM|0x11");
        assert_eq!(CloneFlags(0).to_string(), "0");
    }
}
