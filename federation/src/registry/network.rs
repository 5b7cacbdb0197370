use super::RadioHandle;
use std::net::Ipv4Addr;

/// A set of radios sharing a channel.
#[derive(Clone, Debug)]
pub struct Network {
    pub(crate) name: String,
    pub(crate) frequency: u64,
    pub(crate) address: Ipv4Addr,
    pub(crate) members: Vec<RadioHandle>,
}

impl Network {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Members in configured order.
    pub fn members(&self) -> &[RadioHandle] {
        &self.members
    }

    /// Networks with a non-zero address carry unicast traffic.
    pub fn is_unicast(&self) -> bool {
        !self.address.is_unspecified()
    }
}
