//! Node metadata blob carried by the membership substrate.
//!
//! Layout: `[ready: 1 byte][sort_by: zigzag varint, padded to 10 bytes][user bytes]`.
//! The header is fixed width so the user payload always starts at
//! [`META_HEADER_LEN`].

use crate::error::{BatonError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Longest varint encoding of a 64-bit integer.
pub const MAX_VARINT_LEN64: usize = 10;

pub const META_HEADER_LEN: usize = 1 + MAX_VARINT_LEN64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMeta {
    /// Whether the node may receive newly assigned data.
    pub ready: bool,
    /// Ordering key, the process start time in nanoseconds.
    pub sort_by: i64,
    /// Application payload, passed through untouched.
    pub user: Bytes,
}

impl NodeMeta {
    pub fn new(sort_by: i64) -> Self {
        Self {
            ready: false,
            sort_by,
            user: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(META_HEADER_LEN + self.user.len());
        buf.put_u8(u8::from(self.ready));

        let mut varint = [0u8; MAX_VARINT_LEN64];
        put_varint(&mut varint, self.sort_by);
        buf.put_slice(&varint);

        buf.put_slice(&self.user);
        buf.freeze()
    }

    pub fn decode(meta: &[u8]) -> Result<Self> {
        if meta.len() < META_HEADER_LEN {
            return Err(BatonError::Decode(format!(
                "metadata is {} bytes, need at least {}",
                meta.len(),
                META_HEADER_LEN
            )));
        }

        let sort_by = read_varint(&meta[1..META_HEADER_LEN])
            .map_err(|error| BatonError::Decode(format!("sort_by: {}", error)))?;

        Ok(Self {
            ready: meta[0] == 1,
            sort_by,
            user: Bytes::copy_from_slice(&meta[META_HEADER_LEN..]),
        })
    }
}

fn put_varint(buf: &mut [u8; MAX_VARINT_LEN64], value: i64) -> usize {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    while zigzag >= 0x80 {
        buf[i] = (zigzag as u8) | 0x80;
        zigzag >>= 7;
        i += 1;
    }
    buf[i] = zigzag as u8;
    i + 1
}

fn read_varint(buf: &[u8]) -> std::result::Result<i64, &'static str> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN64 - 1 && byte > 1 {
            return Err("varint overflows 64 bits");
        }
        if byte < 0x80 {
            value |= u64::from(byte) << shift;
            let signed = (value >> 1) as i64;
            return Ok(if value & 1 != 0 { !signed } else { signed });
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    Err("unterminated varint")
}
