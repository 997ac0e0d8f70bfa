//! Policy registration contract.

use crate::error::{PsecError, Result};
use crate::types::{AddAction, AddMethod, DelReason, MacType, PolicyId, PolicySet};
use psec_types::{InterfaceId, VidMac};
use std::sync::Arc;

/// Notification that a MAC address is being admitted on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNotice {
    pub iface: InterfaceId,
    pub vid_mac: VidMac,
    /// Entries on the interface not counting this one.
    pub entry_count_before: u32,
    /// Policy that asked for the add, `None` for a learned frame.
    pub originating: Option<PolicyId>,
}

/// A policy's answer to an [`AddNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddVerdict {
    pub method: AddMethod,
    /// Only honored from [`PolicyId::Admin`].
    pub action: AddAction,
}

impl AddVerdict {
    pub const fn new(method: AddMethod) -> Self {
        Self {
            method,
            action: AddAction::None,
        }
    }

    pub const fn with_action(method: AddMethod, action: AddAction) -> Self {
        Self { method, action }
    }
}

/// Notification that a MAC address has left the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelNotice {
    pub iface: InterfaceId,
    pub vid_mac: VidMac,
    pub reason: DelReason,
    /// The decision this policy last gave for the entry.
    pub method: AddMethod,
    pub originating: Option<PolicyId>,
}

/// A static or sticky MAC a policy wants present regardless of learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticMac {
    pub vid_mac: VidMac,
    pub mac_type: MacType,
}

/// Callbacks implemented by a security policy module.
///
/// The admin policy is called with the engine lock held and must not call
/// back into the engine from these methods. All other policies are called
/// from the dispatcher with no engine lock held.
pub trait SecurityPolicy: Send + Sync {
    fn on_mac_add(&self, notice: &AddNotice) -> AddVerdict;

    fn on_mac_del(&self, notice: &DelNotice);

    /// Static and sticky MACs to install on `iface`, replayed on link-up.
    fn static_entries(&self, _iface: InterfaceId) -> Vec<StaticMac> {
        Vec::new()
    }

    /// Link came up on an interface this policy is not enabled on.
    fn on_link_up(&self, _iface: InterfaceId) {}

    fn on_sticky_change(&self, _iface: InterfaceId, _vid_mac: VidMac, _mac_type: MacType) {}
}

/// Fixed-size table of registered policies, indexed by [`PolicyId`].
#[derive(Default, Clone)]
pub struct PolicyRegistry {
    slots: [Option<Arc<dyn SecurityPolicy>>; PolicyId::COUNT],
}

impl PolicyRegistry {
    pub fn register(&mut self, id: PolicyId, policy: Arc<dyn SecurityPolicy>) -> Result<()> {
        let slot = &mut self.slots[id.index()];
        if slot.is_some() {
            return Err(PsecError::CallbacksAlreadyRegistered(id));
        }
        *slot = Some(policy);
        Ok(())
    }

    pub fn get(&self, id: PolicyId) -> Option<Arc<dyn SecurityPolicy>> {
        self.slots[id.index()].clone()
    }

    pub fn registered(&self) -> PolicySet {
        PolicyId::ALL
            .into_iter()
            .filter(|p| self.slots[p.index()].is_some())
            .collect()
    }
}
