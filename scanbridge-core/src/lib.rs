//! Scanner control-plane protocol reference implementation.
//! Pure logic: no I/O; the agent daemon owns sockets and files.
//!
//! The wire format is a fixed 90-byte datagram (see the `wire` module).
//! Legacy scanner hardware broadcasts a discovery request on UDP, expects a
//! unicast reply, then announces a file transfer that is carried out over a
//! separate raw TCP connection.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::AgentIdentity;
pub use protocol::{
    ControlMessage, RequestKind, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, MESSAGE_LEN, SIGNATURE,
};
pub use wire::{decode, describe, encode, DecodeError};
