//! VLAN identifiers and the (VLAN, MAC) pair learned on a port.

use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier (1-4094).
///
/// A VLAN id also doubles as a forwarding-database id (FID) when shared-VLAN
/// learning maps several VLANs onto one FDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub const DEFAULT: VlanId = VlanId(1);

    /// Lowest and highest valid ids, for range scans over ordered keys.
    pub const FIRST: VlanId = VlanId(Self::MIN);
    pub const LAST: VlanId = VlanId(Self::MAX);

    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl Default for VlanId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "Vlan100" and "100" are both accepted
        let digits = match s.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("vlan") => &s[4..],
            _ => s,
        };
        let id: u16 = digits.parse().map_err(|_| ParseError::InvalidVlanId(0))?;
        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

/// A source MAC address as observed on a given VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VidMac {
    pub vid: VlanId,
    pub mac: MacAddress,
}

impl VidMac {
    pub const fn new(vid: VlanId, mac: MacAddress) -> Self {
        Self { vid, mac }
    }
}

impl fmt::Display for VidMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {}>", self.vid, self.mac)
    }
}
