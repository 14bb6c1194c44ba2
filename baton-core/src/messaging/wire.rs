//! Direct message frames: bincode-encoded, deflate-compressed.
//!
//! Only node names and addresses cross the wire; receivers resolve them to
//! their own node wrappers.

use crate::error::{BatonError, Result};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::SocketAddr;

/// Upper bound on an inflated frame. Guards against decompression bombs.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNodeRef {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMsg {
    pub channel: u32,
    pub src: WireNodeRef,
    pub dst: WireNodeRef,
    pub body: Vec<u8>,
}

pub fn encode_frame(msg: &WireMsg) -> Result<Bytes> {
    let encoded = bincode::serialize(msg)?;
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(encoded.len() / 2), Compression::default());
    encoder.write_all(&encoded)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMsg> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(frame)
        .take(MAX_FRAME_LEN + 1)
        .read_to_end(&mut inflated)
        .map_err(|error| BatonError::Decode(format!("inflate frame: {}", error)))?;

    if inflated.len() as u64 > MAX_FRAME_LEN {
        return Err(BatonError::Decode(format!(
            "frame inflates beyond {} bytes",
            MAX_FRAME_LEN
        )));
    }

    bincode::deserialize(&inflated)
        .map_err(|error| BatonError::Decode(format!("deserialize frame: {}", error)))
}
