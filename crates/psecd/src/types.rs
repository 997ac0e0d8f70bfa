//! Core port-security types: policy identities, decisions, reasons and keys.

use psec_types::{InterfaceId, MacAddress, VidMac, VlanId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default size of the stack-wide MAC pool.
pub const POOL_CAPACITY_DEFAULT: usize = 1024;

/// Aging period bounds in seconds. Zero disables aging.
pub const AGING_PERIOD_MIN: u32 = 10;
pub const AGING_PERIOD_MAX: u32 = 10_000_000;

/// Hold time bounds in seconds. Zero is not a valid hold time.
pub const HOLD_TIME_MIN: u32 = 10;
pub const HOLD_TIME_MAX: u32 = 10_000_000;

/// How long an entry that failed to reach the hardware table keeps its slot.
pub const ZOMBIE_HOLD_SECS: u32 = 300;

/// Bounds on the number of violating entries a restricted port may hold.
pub const VIOLATE_LIMIT_MIN: u32 = 1;
pub const VIOLATE_LIMIT_MAX: u32 = 1023;

/// Bounds on the admission limit of the limit-control policy.
pub const LIMIT_MIN: u32 = 1;
pub const LIMIT_MAX: u32 = 1023;

/// A second learn frame arriving this long after an entry was created means
/// the hardware dropped the entry behind our back.
pub const MAC_TABLE_FULL_GUARD_SECS: u64 = 7;

/// Security policies that can enable themselves on a port.
///
/// Declaration order is arbitration precedence and the iteration order of
/// [`PolicySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyId {
    /// Administrative limit control. Called synchronously under the engine lock.
    Admin,
    Dot1x,
    DhcpSnooping,
    VoiceVlan,
}

impl PolicyId {
    pub const COUNT: usize = 4;
    pub const ALL: [PolicyId; Self::COUNT] = [
        PolicyId::Admin,
        PolicyId::Dot1x,
        PolicyId::DhcpSnooping,
        PolicyId::VoiceVlan,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PolicyId::Admin => "admin",
            PolicyId::Dot1x => "dot1x",
            PolicyId::DhcpSnooping => "dhcp_snooping",
            PolicyId::VoiceVlan => "voice_vlan",
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-size set of policies, iterated in precedence order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet(u8);

impl PolicySet {
    pub const EMPTY: PolicySet = PolicySet(0);

    pub const fn single(policy: PolicyId) -> Self {
        PolicySet(1 << policy as u8)
    }

    pub fn insert(&mut self, policy: PolicyId) -> bool {
        let had = self.contains(policy);
        self.0 |= 1 << policy as u8;
        !had
    }

    pub fn remove(&mut self, policy: PolicyId) -> bool {
        let had = self.contains(policy);
        self.0 &= !(1 << policy as u8);
        had
    }

    pub fn set(&mut self, policy: PolicyId, on: bool) {
        if on {
            self.insert(policy);
        } else {
            self.remove(policy);
        }
    }

    pub const fn contains(&self, policy: PolicyId) -> bool {
        self.0 & (1 << policy as u8) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn union(self, other: PolicySet) -> PolicySet {
        PolicySet(self.0 | other.0)
    }

    pub const fn difference(self, other: PolicySet) -> PolicySet {
        PolicySet(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = PolicyId> {
        PolicyId::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<PolicyId> for PolicySet {
    fn from_iter<I: IntoIterator<Item = PolicyId>>(iter: I) -> Self {
        let mut set = PolicySet::EMPTY;
        for policy in iter {
            set.insert(policy);
        }
        set
    }
}

impl fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A policy's verdict on one MAC address. Ordered by restrictiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddMethod {
    Forward,
    /// Blocked for the hold time, then removed and re-learned.
    Block,
    /// Blocked until the policy says otherwise.
    KeepBlocked,
}

impl fmt::Display for AddMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AddMethod::Forward => "Forward",
            AddMethod::Block => "Block with timeout",
            AddMethod::KeepBlocked => "Keep blocked",
        })
    }
}

/// Side-channel signal from the admin policy when a MAC is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddAction {
    #[default]
    None,
    LimitReached,
    ShutDown,
}

/// Why an entry left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelReason {
    HwAddFailed,
    SwAddFailed,
    PortLinkDown,
    StationMoved,
    AgedOut,
    HoldTimeExpired,
    UserDeleted,
    PortShutDown,
    /// Last policy disabled on the port.
    NoMoreUsers,
    PortStpMstiDiscarding,
    SvlChange,
}

impl DelReason {
    /// Add failures keep the slot occupied as a zombie.
    pub const fn makes_zombie(self) -> bool {
        matches!(self, DelReason::HwAddFailed | DelReason::SwAddFailed)
    }
}

impl fmt::Display for DelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DelReason::HwAddFailed => "MAC table add failed (hardware)",
            DelReason::SwAddFailed => "MAC table add failed (software)",
            DelReason::PortLinkDown => "Port link went down",
            DelReason::StationMoved => "MAC moved to another port",
            DelReason::AgedOut => "Entry aged out",
            DelReason::HoldTimeExpired => "Hold time expired",
            DelReason::UserDeleted => "Deleted by management",
            DelReason::PortShutDown => "Port shut down by limit control",
            DelReason::NoMoreUsers => "No more policies enabled",
            DelReason::PortStpMstiDiscarding => "Spanning tree instance is discarding",
            DelReason::SvlChange => "Shared VLAN mapping changed",
        })
    }
}

/// How a policy wants frames from unknown MACs handled on a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMode {
    #[default]
    Normal,
    /// Learn frames are not admitted; the policy adds MACs explicitly.
    KeepBlocked,
    /// CPU copy stays on after the limit is reached so violations are counted.
    Restrict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacType {
    #[default]
    Dynamic,
    Sticky,
    Static,
}

impl MacType {
    pub const fn is_dynamic(self) -> bool {
        matches!(self, MacType::Dynamic)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Primary,
    Secondary,
}

/// Table key: ordered by interface, then VLAN, then MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacKey {
    pub iface: InterfaceId,
    pub vid: VlanId,
    pub mac: MacAddress,
}

impl MacKey {
    pub const fn new(iface: InterfaceId, vid: VlanId, mac: MacAddress) -> Self {
        Self { iface, vid, mac }
    }

    pub const fn from_vid_mac(iface: InterfaceId, vid_mac: VidMac) -> Self {
        Self::new(iface, vid_mac.vid, vid_mac.mac)
    }

    pub const fn vid_mac(&self) -> VidMac {
        VidMac::new(self.vid, self.mac)
    }
}

impl fmt::Display for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vlan {} mac {}", self.iface, self.vid, self.mac)
    }
}
