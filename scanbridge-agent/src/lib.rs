//! Scanbridge agent: bridges legacy document scanners to modern file
//! processing. Listens for scanner discovery broadcasts on UDP, answers with
//! its own identity, accepts the follow-up transfer request, and receives
//! the file over a raw TCP connection. Received files are stored locally or,
//! in proxy mode, replayed against a downstream agent with the same
//! protocol.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod forwarder;
pub mod netif;
pub mod pending;
pub mod store;
pub mod transport;
