//! Wire codec for the fixed 90-byte control message.
//!
//! Layout (all offsets in bytes):
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 3    | signature    |
//! | 3      | 3    | request type |
//! | 6      | 6    | reserved     |
//! | 12     | 4    | initiator IP |
//! | 16     | 4    | reserved     |
//! | 20     | 20   | src name     |
//! | 40     | 40   | dst name     |
//! | 80     | 10   | reserved     |

use std::net::Ipv4Addr;

use crate::protocol::{
    ControlMessage, RequestKind, DST_NAME_LEN, MESSAGE_LEN, SIGNATURE, SRC_NAME_LEN,
};

/// Encode a message into its 90-byte wire form. Names longer than their
/// field are truncated; non-ASCII bytes become `?`; reserved fields are
/// zeroed. Never fails.
pub fn encode(msg: &ControlMessage) -> [u8; MESSAGE_LEN] {
    let mut out = [0u8; MESSAGE_LEN];
    out[0..3].copy_from_slice(&SIGNATURE);
    out[3..6].copy_from_slice(&msg.request.wire_bytes());
    out[12..16].copy_from_slice(&msg.initiator_ip.octets());
    write_name(&mut out[20..20 + SRC_NAME_LEN], &msg.src_name);
    write_name(&mut out[40..40 + DST_NAME_LEN], &msg.dst_name);
    out
}

/// Decode one control datagram. The input must be exactly 90 bytes with a
/// valid signature and a known request type; reserved bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    if bytes.len() != MESSAGE_LEN {
        return Err(DecodeError::WrongLength(bytes.len()));
    }
    if bytes[0..3] != SIGNATURE {
        return Err(DecodeError::BadSignature);
    }
    let request = RequestKind::from_wire(&bytes[3..6]).ok_or(DecodeError::UnknownRequestType)?;
    let octets: [u8; 4] = bytes[12..16].try_into().map_err(|_| DecodeError::BadIpv4)?;
    Ok(ControlMessage {
        request,
        initiator_ip: Ipv4Addr::from(octets),
        src_name: read_name(&bytes[20..20 + SRC_NAME_LEN]),
        dst_name: read_name(&bytes[40..40 + DST_NAME_LEN]),
    })
}

/// Error decoding an inbound datagram. All of these mean "drop it".
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {MESSAGE_LEN} bytes, got {0}")]
    WrongLength(usize),
    #[error("bad signature")]
    BadSignature,
    #[error("unknown request type")]
    UnknownRequestType,
    #[error("initiator address is not IPv4")]
    BadIpv4,
}

/// Field-by-field hex rendering of an encoded message, for debug logs.
pub fn describe(bytes: &[u8; MESSAGE_LEN]) -> String {
    format!(
        "sig={} type={} ip={} src={} dst={}",
        hex(&bytes[0..3]),
        hex(&bytes[3..6]),
        hex(&bytes[12..16]),
        hex(&bytes[20..20 + SRC_NAME_LEN]),
        hex(&bytes[40..40 + DST_NAME_LEN]),
    )
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn write_name(field: &mut [u8], name: &str) {
    for (slot, byte) in field.iter_mut().zip(name.bytes()) {
        *slot = if byte.is_ascii() { byte } else { b'?' };
    }
}

fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
