//! Decoding of the fixed-layout structures the kernel side writes into the ring buffer.
//!
//! Layouts are little-endian C structs. Every record shares one ring buffer, so the
//! payload length tells which layout a record was written with: a payload is decoded
//! only when its length is the layout size, possibly padded by perf.

use bytes::Buf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not a {kind} record: expected {expected} bytes, got {actual}")]
pub struct DecodeError {
    pub kind: &'static str,
    pub expected: usize,
    pub actual: usize,
}

/// A structure with a statically known layout.
pub trait FixedLayout: Sized {
    /// Name used in error messages
    const KIND: &'static str;
    /// Size in bytes, explicit padding included
    const SIZE: usize;

    /// Read the structure. `reader` is guaranteed to hold at least `SIZE` bytes.
    fn read(reader: &mut RecordReader<'_>) -> Self;

    /// Payload lengths a record of this layout arrives with: the exact size, the size
    /// aligned to 8 bytes, or the size perf gives a raw sample behind its `u32` header.
    fn accepts(len: usize) -> bool {
        len == Self::SIZE
            || len == Self::SIZE.next_multiple_of(8)
            || len == (Self::SIZE + 4).next_multiple_of(8) - 4
    }
}

/// Decode a payload as `T`. Pure: nothing but the payload is looked at.
pub fn decode<T: FixedLayout>(payload: &[u8]) -> Result<T, DecodeError> {
    if !T::accepts(payload.len()) {
        return Err(DecodeError {
            kind: T::KIND,
            expected: T::SIZE,
            actual: payload.len(),
        });
    }
    let mut reader = RecordReader {
        buf: &payload[..T::SIZE],
    };
    Ok(T::read(&mut reader))
}

/// Sequential little-endian reader over a length-checked payload.
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl RecordReader<'_> {
    pub fn u16(&mut self) -> u16 {
        self.buf.get_u16_le()
    }

    pub fn u32(&mut self) -> u32 {
        self.buf.get_u32_le()
    }

    pub fn i32(&mut self) -> i32 {
        self.buf.get_i32_le()
    }

    pub fn u64(&mut self) -> u64 {
        self.buf.get_u64_le()
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        self.buf.copy_to_slice(&mut out);
        out
    }

    /// Skip explicit padding.
    pub fn pad(&mut self, len: usize) {
        self.buf.advance(len);
    }
}

/// Convert a NUL padded C string buffer to text. The first zero byte terminates the
/// string, whatever follows is ignored.
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        a: u32,
        b: u64,
        name: [u8; 4],
    }

    impl FixedLayout for Sample {
        const KIND: &'static str = "sample";
        const SIZE: usize = 20;

        fn read(reader: &mut RecordReader<'_>) -> Self {
            let a = reader.u32();
            reader.pad(4);
            Self {
                a,
                b: reader.u64(),
                name: reader.array(),
            }
        }
    }

    fn encode(a: u32, b: u64, name: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&a.to_le_bytes());
        buf.extend_from_slice(&[0xff; 4]);
        buf.extend_from_slice(&b.to_le_bytes());
        buf.extend_from_slice(&name);
        buf
    }

    #[test]
    fn decode_little_endian_with_padding() {
        let sample: Sample = decode(&encode(7, 0x0102_0304_0506_0708, *b"abc\0")).unwrap();
        assert_eq!(
            sample,
            Sample {
                a: 7,
                b: 0x0102_0304_0506_0708,
                name: *b"abc\0"
            }
        );
    }

    #[test]
    fn perf_padding_is_accepted() {
        let mut buf = encode(1, 2, [0; 4]);
        buf.extend_from_slice(&[0xaa; 4]);
        assert_eq!(decode::<Sample>(&buf).map(|s| s.b), Ok(2));

        buf.extend_from_slice(&[0xaa; 4]);
        assert_eq!(
            decode::<Sample>(&buf),
            Err(DecodeError {
                kind: "sample",
                expected: 20,
                actual: 28
            })
        );
    }

    #[test]
    fn record_lengths_tell_layouts_apart() {
        struct Layout<const N: usize>;
        impl<const N: usize> FixedLayout for Layout<N> {
            const KIND: &'static str = "layout";
            const SIZE: usize = N;

            fn read(_reader: &mut RecordReader<'_>) -> Self {
                Self
            }
        }

        assert!(Layout::<68>::accepts(68));
        assert!(Layout::<68>::accepts(72));
        assert!(Layout::<16>::accepts(16));
        assert!(Layout::<16>::accepts(20));
        assert!(!Layout::<16>::accepts(24));
        assert!(Layout::<32>::accepts(36));
        assert!(Layout::<56>::accepts(60));
        for len in [16, 20, 32, 36, 56, 60] {
            assert!(!Layout::<68>::accepts(len));
        }
        for len in [32, 36, 56, 60, 68, 72] {
            assert!(!Layout::<16>::accepts(len));
        }
        for len in [16, 20, 56, 60, 68, 72] {
            assert!(!Layout::<32>::accepts(len));
        }
        for len in [16, 20, 32, 36, 68, 72] {
            assert!(!Layout::<56>::accepts(len));
        }
    }

    #[test]
    fn c_string_stops_at_first_zero() {
        assert_eq!(c_string(b"/bin/ls\0\0\0"), "/bin/ls");
        assert_eq!(c_string(b"abc\0def\0"), "abc");
        assert_eq!(c_string(b"\0abc"), "");
        assert_eq!(c_string(b"full"), "full");
        assert_eq!(c_string(b""), "");
    }

    #[test]
    fn c_string_is_stable_under_zero_padding() {
        for text in ["", "a", "bash", "/usr/bin/containerd-shim"] {
            for padding in [1, 2, 7, 32] {
                let mut buf = text.as_bytes().to_vec();
                buf.resize(text.len() + padding, 0);
                assert_eq!(c_string(&buf), text);
                // Garbage after the terminator doesn't matter either
                buf.extend_from_slice(b"junk");
                assert_eq!(c_string(&buf), text);
            }
        }
    }
}
