//! Collaborators the engine drives but does not own.
//!
//! Every external dependency sits behind a `Send + Sync` trait so the engine
//! can be exercised against the in-memory implementations in [`memory`].

use crate::error::HalError;
use crate::stack::StackTransport;
use psec_types::{InterfaceId, MacAddress, VlanId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Identifier handed out by the IP admission filter for an installed rule.
pub type RuleId = u32;

/// MSTI 0 is the common spanning tree.
pub type Msti = u8;

/// An entry as installed in the hardware MAC table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwMacEntry {
    pub fid: VlanId,
    pub mac: MacAddress,
    /// `None` while the entry is blocked.
    pub destination: Option<InterfaceId>,
    pub copy_to_cpu: bool,
    /// Locked entries are never aged or moved by hardware learning.
    pub locked: bool,
}

/// Hardware MAC table driver.
pub trait HardwareMacTable: Send + Sync {
    /// Adds or overwrites the entry for `(fid, mac)`.
    fn add(&self, entry: &HwMacEntry) -> Result<(), HalError>;
    fn delete(&self, fid: VlanId, mac: MacAddress) -> Result<(), HalError>;
    /// Switches a port between normal and secure learning. With secure
    /// learning on, unknown source MACs are dropped and optionally copied to
    /// the CPU.
    fn set_secure_learning(&self, iface: InterfaceId, enabled: bool, cpu_copy: bool) -> Result<(), HalError>;
}

/// Which ingress ports a deny-list rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMask {
    All,
    AllExcept(InterfaceId),
    Only(BTreeSet<InterfaceId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyAction {
    Drop,
    CheckAllowList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyRule {
    pub mac: Option<MacAddress>,
    pub vid: Option<VlanId>,
    pub ports: PortMask,
    pub action: DenyAction,
}

/// Kernel IP admission filter.
pub trait IpAdmissionFilter: Send + Sync {
    fn allow_list_add(&self, mac: MacAddress, vid: VlanId) -> Result<RuleId, HalError>;
    fn deny_list_add(&self, rule: DenyRule) -> Result<RuleId, HalError>;
    fn rule_update(&self, id: RuleId, rule: DenyRule) -> Result<(), HalError>;
    fn rule_del(&self, id: RuleId) -> Result<(), HalError>;
}

/// VLAN to MST instance mapping. Per-port forwarding state is pushed to the
/// engine through `Engine::stp_discarding_change`.
pub trait SpanningTree: Send + Sync {
    fn msti_for_vlan(&self, vid: VlanId) -> Msti;
}

/// Shared-VLAN learning: maps a VLAN to the FDB it learns into.
pub trait FidMapper: Send + Sync {
    fn fid_for(&self, vid: VlanId) -> VlanId;
}

/// Bundle of collaborators handed to the engine at construction.
#[derive(Clone)]
pub struct Hal {
    pub mac_table: Arc<dyn HardwareMacTable>,
    pub ip_filter: Arc<dyn IpAdmissionFilter>,
    pub stp: Arc<dyn SpanningTree>,
    pub fids: Arc<dyn FidMapper>,
    pub transport: Arc<dyn StackTransport>,
}

impl Hal {
    /// All-in-memory collaborators, used by the standalone daemon and tests.
    pub fn in_memory() -> (Self, memory::Handles) {
        let handles = memory::Handles::default();
        let hal = Hal {
            mac_table: handles.mac_table.clone(),
            ip_filter: handles.ip_filter.clone(),
            stp: handles.stp.clone(),
            fids: handles.fids.clone(),
            transport: handles.transport.clone(),
        };
        (hal, handles)
    }
}

pub mod memory {
    //! In-memory collaborators with failure injection.

    use super::*;
    use crate::stack::StackEnvelope;
    use parking_lot::Mutex;
    use psec_types::NodeId;
    use std::collections::{BTreeMap, HashMap};

    /// Concrete handles to the in-memory collaborators behind a [`Hal`].
    #[derive(Clone, Default)]
    pub struct Handles {
        pub mac_table: Arc<MemoryMacTable>,
        pub ip_filter: Arc<MemoryIpFilter>,
        pub stp: Arc<MemorySpanningTree>,
        pub fids: Arc<MemoryFidMapper>,
        pub transport: Arc<MemoryTransport>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecureLearning {
        pub enabled: bool,
        pub cpu_copy: bool,
    }

    #[derive(Default)]
    struct MacTableInner {
        entries: BTreeMap<(VlanId, MacAddress), HwMacEntry>,
        learning: HashMap<InterfaceId, SecureLearning>,
        fail_adds: Option<HalError>,
        capacity: Option<usize>,
        add_calls: usize,
    }

    #[derive(Default)]
    pub struct MemoryMacTable {
        inner: Mutex<MacTableInner>,
    }

    impl MemoryMacTable {
        pub fn entry(&self, fid: VlanId, mac: MacAddress) -> Option<HwMacEntry> {
            self.inner.lock().entries.get(&(fid, mac)).cloned()
        }

        pub fn len(&self) -> usize {
            self.inner.lock().entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn add_calls(&self) -> usize {
            self.inner.lock().add_calls
        }

        pub fn learning(&self, iface: InterfaceId) -> SecureLearning {
            self.inner.lock().learning.get(&iface).copied().unwrap_or_default()
        }

        /// Every subsequent add fails with `err` until cleared with `None`.
        pub fn fail_adds(&self, err: Option<HalError>) {
            self.inner.lock().fail_adds = err;
        }

        /// Adds of new keys beyond `capacity` fail with [`HalError::TableFull`].
        pub fn set_capacity(&self, capacity: Option<usize>) {
            self.inner.lock().capacity = capacity;
        }

        /// Drops an entry without telling anyone, like a hash-collision eviction.
        pub fn evict(&self, fid: VlanId, mac: MacAddress) {
            self.inner.lock().entries.remove(&(fid, mac));
        }
    }

    impl HardwareMacTable for MemoryMacTable {
        fn add(&self, entry: &HwMacEntry) -> Result<(), HalError> {
            let mut inner = self.inner.lock();
            inner.add_calls += 1;
            if let Some(err) = inner.fail_adds.clone() {
                return Err(err);
            }
            let key = (entry.fid, entry.mac);
            if let Some(cap) = inner.capacity {
                if !inner.entries.contains_key(&key) && inner.entries.len() >= cap {
                    return Err(HalError::TableFull);
                }
            }
            inner.entries.insert(key, entry.clone());
            Ok(())
        }

        fn delete(&self, fid: VlanId, mac: MacAddress) -> Result<(), HalError> {
            self.inner
                .lock()
                .entries
                .remove(&(fid, mac))
                .map(|_| ())
                .ok_or_else(|| HalError::Failed(format!("no entry for {mac} in fid {fid}")))
        }

        fn set_secure_learning(&self, iface: InterfaceId, enabled: bool, cpu_copy: bool) -> Result<(), HalError> {
            self.inner
                .lock()
                .learning
                .insert(iface, SecureLearning { enabled, cpu_copy });
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum InstalledRule {
        Allow { mac: MacAddress, vid: VlanId },
        Deny(DenyRule),
    }

    #[derive(Default)]
    struct IpFilterInner {
        next_id: RuleId,
        rules: BTreeMap<RuleId, InstalledRule>,
    }

    #[derive(Default)]
    pub struct MemoryIpFilter {
        inner: Mutex<IpFilterInner>,
    }

    impl MemoryIpFilter {
        pub fn rules(&self) -> Vec<InstalledRule> {
            self.inner.lock().rules.values().cloned().collect()
        }

        pub fn allows(&self, mac: MacAddress, vid: VlanId) -> bool {
            self.inner
                .lock()
                .rules
                .values()
                .any(|r| *r == InstalledRule::Allow { mac, vid })
        }

        pub fn deny_rule_for(&self, mac: MacAddress) -> Option<DenyRule> {
            self.inner.lock().rules.values().find_map(|r| match r {
                InstalledRule::Deny(rule) if rule.mac == Some(mac) => Some(rule.clone()),
                _ => None,
            })
        }

        fn insert(&self, rule: InstalledRule) -> RuleId {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rules.insert(id, rule);
            id
        }
    }

    impl IpAdmissionFilter for MemoryIpFilter {
        fn allow_list_add(&self, mac: MacAddress, vid: VlanId) -> Result<RuleId, HalError> {
            Ok(self.insert(InstalledRule::Allow { mac, vid }))
        }

        fn deny_list_add(&self, rule: DenyRule) -> Result<RuleId, HalError> {
            Ok(self.insert(InstalledRule::Deny(rule)))
        }

        fn rule_update(&self, id: RuleId, rule: DenyRule) -> Result<(), HalError> {
            match self.inner.lock().rules.get_mut(&id) {
                Some(slot) => {
                    *slot = InstalledRule::Deny(rule);
                    Ok(())
                }
                None => Err(HalError::Failed(format!("no rule {id}"))),
            }
        }

        fn rule_del(&self, id: RuleId) -> Result<(), HalError> {
            self.inner
                .lock()
                .rules
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| HalError::Failed(format!("no rule {id}")))
        }
    }

    #[derive(Default)]
    pub struct MemorySpanningTree {
        vlan_msti: Mutex<HashMap<VlanId, Msti>>,
    }

    impl MemorySpanningTree {
        pub fn map_vlan(&self, vid: VlanId, msti: Msti) {
            self.vlan_msti.lock().insert(vid, msti);
        }
    }

    impl SpanningTree for MemorySpanningTree {
        fn msti_for_vlan(&self, vid: VlanId) -> Msti {
            self.vlan_msti.lock().get(&vid).copied().unwrap_or(0)
        }
    }

    /// Independent VLAN learning unless a VLAN is explicitly mapped.
    #[derive(Default)]
    pub struct MemoryFidMapper {
        map: Mutex<HashMap<VlanId, VlanId>>,
    }

    impl MemoryFidMapper {
        pub fn map(&self, vid: VlanId, fid: VlanId) {
            self.map.lock().insert(vid, fid);
        }
    }

    impl FidMapper for MemoryFidMapper {
        fn fid_for(&self, vid: VlanId) -> VlanId {
            self.map.lock().get(&vid).copied().unwrap_or(vid)
        }
    }

    /// Records every envelope instead of delivering it.
    #[derive(Default)]
    pub struct MemoryTransport {
        sent: Mutex<Vec<(NodeId, StackEnvelope)>>,
    }

    impl MemoryTransport {
        pub fn sent(&self) -> Vec<(NodeId, StackEnvelope)> {
            self.sent.lock().clone()
        }

        pub fn take(&self) -> Vec<(NodeId, StackEnvelope)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl StackTransport for MemoryTransport {
        fn send(&self, to: NodeId, envelope: StackEnvelope) -> Result<(), HalError> {
            self.sent.lock().push((to, envelope));
            Ok(())
        }
    }
}
