//! Agent identity: who this agent is on the network, and how it answers.

use std::net::Ipv4Addr;

use crate::protocol::{ControlMessage, RequestKind, SRC_NAME_LEN};

/// Immutable identity of a running agent, constructed once at startup.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub local_ip: Ipv4Addr,
    pub broadcast_ip: Ipv4Addr,
    pub interface_name: String,
    /// Logical name, at most [`SRC_NAME_LEN`] ASCII bytes.
    pub agent_name: String,
}

impl AgentIdentity {
    /// `agent_name` is sanitized the same way the codec would: non-ASCII
    /// characters become `?` and the result is truncated to the field width.
    pub fn new(
        local_ip: Ipv4Addr,
        broadcast_ip: Ipv4Addr,
        interface_name: impl Into<String>,
        agent_name: &str,
    ) -> Self {
        let agent_name: String = agent_name
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .take(SRC_NAME_LEN)
            .collect();
        Self {
            local_ip,
            broadcast_ip,
            interface_name: interface_name.into(),
            agent_name,
        }
    }

    /// Build the unicast reply to an inbound request: this agent as the
    /// initiator and source, the requester's name echoed as destination.
    /// The request type is echoed unchanged, so a discovery gets a discovery
    /// response and a transfer request gets a transfer acknowledgement.
    pub fn reply_to(&self, inbound: &ControlMessage) -> ControlMessage {
        ControlMessage::new(
            inbound.request,
            self.local_ip,
            self.agent_name.clone(),
            inbound.src_name.clone(),
        )
    }

    /// Build the transfer request this agent sends when it acts as a client
    /// (forwarding a received file downstream).
    pub fn transfer_request(&self, dst_name: &str) -> ControlMessage {
        ControlMessage::new(
            RequestKind::Transfer,
            self.local_ip,
            self.agent_name.clone(),
            dst_name,
        )
    }
}
