//! L2 primitives shared by the port security engine and its policy modules.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`VidMac`]: a (VLAN, MAC) pair as learned on a port
//! - [`NodeId`], [`PortNo`], [`InterfaceId`]: stack-aware interface addressing

mod iface;
mod mac;
mod vlan;

pub use iface::{InterfaceId, NodeId, PortNo};
pub use mac::MacAddress;
pub use vlan::{VidMac, VlanId};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid node ID: {0} (must be 1-16)")]
    InvalidNodeId(u8),

    #[error("invalid interface: {0}")]
    InvalidInterface(String),
}
