//! Operations exposed to policy modules and management.

use super::pipeline::{AddOrigin, PoolEvent};
use super::{Engine, EngineState};
use crate::arbiter::PolicyTimers;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{PsecError, Result};
use crate::hal::Msti;
use crate::policy::SecurityPolicy;
use crate::stack::{StackEnvelope, StackMessage};
use crate::table::EntryHandle;
use crate::types::{
    AddMethod, DelReason, MacKey, MacType, PolicyId, PortMode, AGING_PERIOD_MAX, AGING_PERIOD_MIN,
    HOLD_TIME_MAX, HOLD_TIME_MIN, VIOLATE_LIMIT_MAX, VIOLATE_LIMIT_MIN,
};
use psec_types::{InterfaceId, MacAddress, NodeId, VidMac, VlanId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a policy is enabled on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub enabled: bool,
    pub mode: PortMode,
    /// Clear a shut-down or limit-reached port.
    pub reopen: bool,
    /// Admin only.
    pub violate_limit: u32,
    /// Admin only.
    pub sticky: bool,
}

impl PortConf {
    pub const fn new(enabled: bool, mode: PortMode) -> Self {
        Self {
            enabled,
            mode,
            reopen: false,
            violate_limit: VIOLATE_LIMIT_MIN,
            sticky: false,
        }
    }
}

/// Selects entries for [`Engine::clear`]. Empty matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearFilter {
    pub iface: Option<InterfaceId>,
    pub vid: Option<VlanId>,
    pub mac: Option<MacAddress>,
}

impl ClearFilter {
    pub fn matches(&self, key: &MacKey) -> bool {
        self.iface.is_none_or(|i| i == key.iface)
            && self.vid.is_none_or(|v| v == key.vid)
            && self.mac.is_none_or(|m| m == key.mac)
    }
}

impl Engine {
    pub fn register(&self, policy_id: PolicyId, policy: Arc<dyn SecurityPolicy>) -> Result<()> {
        self.with_state(|state| state.registry.register(policy_id, policy))?;
        info!(policy = %policy_id, "Policy registered");
        Ok(())
    }

    /// Sets a policy's aging period (0 disables aging) and hold time, and
    /// re-times existing entries.
    pub fn set_timers(&self, policy_id: PolicyId, aging_period: u32, hold_time: u32) -> Result<()> {
        if aging_period != 0 && !(AGING_PERIOD_MIN..=AGING_PERIOD_MAX).contains(&aging_period) {
            return Err(PsecError::InvalidAgingPeriod(aging_period));
        }
        if !(HOLD_TIME_MIN..=HOLD_TIME_MAX).contains(&hold_time) {
            return Err(PsecError::InvalidHoldTime(hold_time));
        }
        self.with_state(|state| {
            state.timers[policy_id.index()] = PolicyTimers { aging_period, hold_time };
            for handle in state.table.handles() {
                let Some(entry) = state.table.get(handle) else {
                    continue;
                };
                if state.iface(entry.key.iface).enabled.contains(policy_id) {
                    state.mac_chg_or_zombie(handle, true);
                }
            }
        });
        debug!(policy = %policy_id, aging_period, hold_time, "Timers updated");
        Ok(())
    }

    /// Enables or disables a non-admin policy on `iface`.
    pub fn set_enabled(&self, policy_id: PolicyId, iface: InterfaceId, enabled: bool, mode: PortMode) -> Result<()> {
        if policy_id == PolicyId::Admin {
            return Err(PsecError::InvalidPolicy(policy_id));
        }
        self.set_enabled_with(policy_id, iface, PortConf::new(enabled, mode))
    }

    pub fn set_enabled_with(&self, policy_id: PolicyId, iface: InterfaceId, conf: PortConf) -> Result<()> {
        if policy_id == PolicyId::Admin && !(VIOLATE_LIMIT_MIN..=VIOLATE_LIMIT_MAX).contains(&conf.violate_limit) {
            return Err(PsecError::InvalidViolationLimit(conf.violate_limit));
        }
        self.with_state(|state| {
            state.ensure_primary()?;
            state.check_interface(iface)?;
            if state.registry.get(policy_id).is_none() {
                return Err(PsecError::InvalidPolicy(policy_id));
            }
            state.set_enabled(policy_id, iface, conf);
            Ok(())
        })?;
        info!(policy = %policy_id, interface = %iface, enabled = conf.enabled, mode = ?conf.mode, "Policy enablement changed");
        let action = if conf.enabled { "policy_enable" } else { "policy_disable" };
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "psec", action)
            .with_object_id(iface.to_string())
            .with_object_type("interface")
            .with_details(serde_json::json!({
                "policy": policy_id.to_string(),
                "mode": format!("{:?}", conf.mode),
                "reopen": conf.reopen,
            })));
        Ok(())
    }

    /// Adds a MAC on behalf of a policy running in keep-blocked mode.
    pub fn explicit_add(&self, policy_id: PolicyId, iface: InterfaceId, vid_mac: VidMac, method: AddMethod) -> Result<()> {
        if policy_id == PolicyId::Admin {
            return Err(PsecError::InvalidPolicy(policy_id));
        }
        if !vid_mac.mac.is_unicast() {
            return Err(PsecError::MacNotUnicast);
        }
        self.with_state(|state| {
            state.ensure_primary()?;
            state.check_interface(iface)?;
            let port = state.iface(iface);
            if !port.enabled.contains(policy_id) || port.modes[policy_id.index()] != PortMode::KeepBlocked {
                return Err(PsecError::InvalidPolicyMode(policy_id));
            }
            let fid = state.hal.fids.fid_for(vid_mac.vid);
            if let Some(existing) = state.table.lookup_by_fid_mac(fid, vid_mac.mac).and_then(|h| state.table.get(h)) {
                return Err(if existing.key.vid == vid_mac.vid {
                    PsecError::AlreadyPresent(existing.key.iface)
                } else {
                    PsecError::AlreadyPresentOnSharedVlan(existing.key.vid.as_u16())
                });
            }
            let mac_type = if port.sticky { MacType::Sticky } else { MacType::Dynamic };
            let key = MacKey::from_vid_mac(iface, vid_mac);
            state.mac_add(key, fid, mac_type, AddOrigin::explicit(policy_id, method))?;
            Ok(())
        })
    }

    pub fn explicit_del(&self, policy_id: PolicyId, iface: InterfaceId, vid_mac: VidMac) -> Result<()> {
        if policy_id == PolicyId::Admin {
            return Err(PsecError::InvalidPolicy(policy_id));
        }
        self.with_state(|state| {
            state.ensure_primary()?;
            let port = state.iface(iface);
            if !port.enabled.contains(policy_id) || port.modes[policy_id.index()] != PortMode::KeepBlocked {
                return Err(PsecError::InvalidPolicyMode(policy_id));
            }
            let handle = state.live_handle(iface, vid_mac)?;
            state.mac_del(handle, DelReason::UserDeleted, Some(policy_id));
            Ok(())
        })
    }

    /// Replaces a policy's decision on an existing entry.
    pub fn change_decision(&self, policy_id: PolicyId, iface: InterfaceId, vid_mac: VidMac, method: AddMethod) -> Result<()> {
        self.with_state(|state| {
            state.ensure_primary()?;
            if !state.iface(iface).enabled.contains(policy_id) {
                return Err(PsecError::InvalidPolicy(policy_id));
            }
            let handle = state.live_handle(iface, vid_mac)?;
            if let Some(entry) = state.table.get_mut(handle) {
                if entry.decision(policy_id) == method {
                    return Ok(());
                }
                entry.set_decision(policy_id, method);
            }
            state.mac_chg_or_zombie(handle, false);
            Ok(())
        })
    }

    /// Installs a static or sticky MAC for the admin policy.
    pub fn add_special(&self, iface: InterfaceId, vid_mac: VidMac, mac_type: MacType) -> Result<()> {
        if !vid_mac.mac.is_unicast() {
            return Err(PsecError::MacNotUnicast);
        }
        self.with_state(|state| {
            state.ensure_primary()?;
            state.check_interface(iface)?;
            state.add_special(iface, vid_mac, mac_type)
        })
    }

    pub fn del_special(&self, iface: InterfaceId, vid_mac: VidMac) -> Result<()> {
        self.with_state(|state| {
            state.ensure_primary()?;
            let handle = state.live_handle(iface, vid_mac)?;
            state.mac_del(handle, DelReason::UserDeleted, Some(PolicyId::Admin));
            Ok(())
        })
    }

    /// Converts learned entries on `iface` between dynamic and sticky.
    pub fn port_sticky_set(&self, iface: InterfaceId, sticky: bool) -> Result<()> {
        self.with_state(|state| {
            state.ensure_primary()?;
            state.check_interface(iface)?;
            state.iface_mut(iface).sticky = sticky;
            let (from, to) = if sticky {
                (MacType::Dynamic, MacType::Sticky)
            } else {
                (MacType::Sticky, MacType::Dynamic)
            };
            let admin = state.registry.get(PolicyId::Admin);
            for handle in state.table.handles_on(iface) {
                let Some(entry) = state.table.get_mut(handle) else {
                    continue;
                };
                if entry.is_zombie() || entry.violating || entry.blocked || entry.mac_type != from {
                    continue;
                }
                entry.mac_type = to;
                let vid_mac = entry.key.vid_mac();
                if let Some(admin) = &admin {
                    admin.on_sticky_change(iface, vid_mac, to);
                }
                state.mac_chg_or_zombie(handle, true);
            }
            Ok(())
        })
    }

    /// Deletes dynamic entries matching `filter`. Returns how many went.
    pub fn clear(&self, filter: ClearFilter) -> Result<usize> {
        let cleared = self.with_state(|state| {
            state.ensure_primary()?;
            if let Some(iface) = filter.iface {
                state.check_interface(iface)?;
            }
            let mut cleared = 0;
            for handle in state.table.handles() {
                let Some(entry) = state.table.get(handle) else {
                    continue;
                };
                if entry.is_zombie() || !entry.mac_type.is_dynamic() || !filter.matches(&entry.key) {
                    continue;
                }
                state.mac_del(handle, DelReason::UserDeleted, None);
                cleared += 1;
            }
            Ok(cleared)
        })?;
        audit_log!(AuditRecord::new(AuditCategory::AdminAction, "psec", "clear")
            .with_object_id(filter.iface.map_or_else(|| "all".to_string(), |iface| iface.to_string()))
            .with_object_type("interface")
            .with_details(serde_json::json!({ "cleared": cleared })));
        Ok(cleared)
    }

    /// Link state change on a port.
    ///
    /// On link-up, every registered policy that is not enabled on the port
    /// is told about it. Nothing of the kind happens on link-down.
    pub fn link_state_change(&self, iface: InterfaceId, up: bool) {
        let notify = self.with_state(|state| {
            let port = state.iface_mut(iface);
            port.link_up = up;
            port.shut_down = false;
            port.limit_reached = false;
            if up {
                state.replay_static(iface);
            } else {
                state.del_all(iface, DelReason::PortLinkDown, None, true);
            }
            state.cpu_copy_check(iface, PoolEvent::None);

            if !up {
                return Vec::new();
            }
            let enabled = state.iface(iface).enabled;
            state
                .registry
                .registered()
                .difference(enabled)
                .iter()
                .filter_map(|p| state.registry.get(p))
                .collect()
        });
        info!(interface = %iface, up, "Link state changed");
        for policy in notify {
            policy.on_link_up(iface);
        }
    }

    /// Spanning tree forwarding state of one MST instance on `iface`.
    pub fn stp_discarding_change(&self, iface: InterfaceId, msti: Msti, discarding: bool) {
        self.with_state(|state| {
            let port = state.iface_mut(iface);
            let changed = if discarding {
                port.discarding.insert(msti)
            } else {
                port.discarding.remove(&msti)
            };
            if !changed || !discarding {
                return;
            }
            for handle in state.table.handles_on(iface) {
                let Some(entry) = state.table.get(handle) else {
                    continue;
                };
                if entry.mac_type.is_dynamic() && state.hal.stp.msti_for_vlan(entry.key.vid) == msti {
                    state.mac_del(handle, DelReason::PortStpMstiDiscarding, None);
                }
            }
        });
        debug!(interface = %iface, msti, discarding, "Spanning tree state changed");
    }

    /// VLAN `vid` now learns into `new_fid` instead of `old_fid`.
    pub fn fid_change(&self, vid: VlanId, old_fid: VlanId, new_fid: VlanId) {
        if old_fid == new_fid {
            return;
        }
        self.with_state(|state| {
            for handle in state.table.handles() {
                let Some(entry) = state.table.get(handle) else {
                    continue;
                };
                if entry.key.vid != vid || entry.fid != old_fid {
                    continue;
                }
                let (mac, in_hw) = (entry.key.mac, entry.in_hw);
                if state.table.lookup_by_fid_mac(new_fid, mac).is_some() {
                    state.mac_del(handle, DelReason::SvlChange, None);
                    continue;
                }
                if in_hw {
                    if let Err(e) = state.hal.mac_table.delete(old_fid, mac) {
                        debug!(mac = %mac, fid = %old_fid, error = %e, "Hardware MAC delete failed");
                    }
                }
                if let Some(entry) = state.table.get_mut(handle) {
                    entry.fid = new_fid;
                }
                if in_hw {
                    state.hw_write_or_zombie(handle);
                }
            }
        });
        info!(vid = %vid, old_fid = %old_fid, new_fid = %new_fid, "Shared VLAN mapping changed");
    }

    /// A node joined the stack.
    pub fn switch_add(&self, node: NodeId) {
        self.with_state(|state| {
            state.nodes_present[node.index()] = true;
            state.push_switch_conf(node);
            let ports: Vec<InterfaceId> = state.ifaces.keys().filter(|i| i.node == node).copied().collect();
            for iface in ports {
                state.cpu_copy_check(iface, PoolEvent::None);
            }
        });
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "psec", "switch_add")
            .with_object_id(node.to_string())
            .with_object_type("node"));
    }

    /// A node left the stack. Its entries go without touching its hardware.
    pub fn switch_del(&self, node: NodeId) {
        self.with_state(|state| {
            state.nodes_present[node.index()] = false;
            let ports: Vec<InterfaceId> = state.ifaces.keys().filter(|i| i.node == node).copied().collect();
            for iface in ports {
                state.del_all(iface, DelReason::PortShutDown, None, false);
                state.cpu_copy_check(iface, PoolEvent::None);
            }
        });
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "psec", "switch_del")
            .with_object_id(node.to_string())
            .with_object_type("node"));
    }

    pub fn check_interface(&self, iface: InterfaceId) -> Result<()> {
        self.with_state(|state| state.check_interface(iface))
    }
}

impl EngineState {
    fn set_enabled(&mut self, policy_id: PolicyId, iface: InterfaceId, conf: PortConf) {
        let was = self.iface(iface);
        let was_enabled = was.enabled.contains(policy_id);

        let port = self.iface_mut(iface);
        port.enabled.set(policy_id, conf.enabled);
        port.modes[policy_id.index()] = if conf.enabled { conf.mode } else { PortMode::Normal };
        let enabled = port.enabled;
        let modes = port.modes;
        port.learn_frames_blocked = enabled
            .iter()
            .any(|p| modes[p.index()] == PortMode::KeepBlocked);
        port.keep_cpu_copy = enabled.iter().any(|p| modes[p.index()] == PortMode::Restrict);
        if (was.keep_cpu_copy && !port.keep_cpu_copy) || policy_id == PolicyId::Admin {
            port.cur_violate = 0;
            port.limit_reached = false;
            port.latest_violator = None;
        }
        if policy_id == PolicyId::Admin {
            port.violate_limit = conf.violate_limit;
            port.sticky = conf.sticky;
        }

        if conf.enabled {
            self.del_all(iface, DelReason::UserDeleted, Some(policy_id), false);
            if was.enabled.is_empty() {
                self.push_port_conf(iface, true);
            }
        } else if was_enabled && !enabled.is_empty() {
            for handle in self.table.handles_on(iface) {
                if policy_id == PolicyId::Admin {
                    if let Some(entry) = self.table.get_mut(handle) {
                        entry.mac_type = MacType::Dynamic;
                    }
                }
                self.mac_chg_or_zombie(handle, false);
            }
        } else if was_enabled {
            self.push_port_conf(iface, false);
            self.del_all(iface, DelReason::NoMoreUsers, None, false);
            self.cpu_copy_check(iface, PoolEvent::None);
        }

        if conf.reopen {
            let port = self.iface_mut(iface);
            let was_shut_down = std::mem::take(&mut port.shut_down);
            port.limit_reached = false;
            if was_shut_down {
                audit_log!(AuditRecord::new(AuditCategory::PortState, "psec", "port_reopen")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(iface.to_string())
                    .with_object_type("interface"));
            }
        }
        self.cpu_copy_check(iface, PoolEvent::None);

        if conf.enabled {
            self.replay_static(iface);
        }
    }

    /// Forced add of the admin policy's static and sticky MACs.
    fn replay_static(&mut self, iface: InterfaceId) {
        if !self.iface(iface).enabled.contains(PolicyId::Admin) {
            return;
        }
        let Some(admin) = self.registry.get(PolicyId::Admin) else {
            return;
        };
        let entries = admin.static_entries(iface);
        if entries.is_empty() {
            return;
        }

        self.iface_mut(iface).static_add_in_progress = true;
        self.cpu_copy_check(iface, PoolEvent::None);
        for entry in entries {
            if let Err(e) = self.add_special(iface, entry.vid_mac, entry.mac_type) {
                debug!(interface = %iface, mac = %entry.vid_mac.mac, error = %e, "Static MAC replay failed");
            }
        }
        self.iface_mut(iface).static_add_in_progress = false;
        self.cpu_copy_check(iface, PoolEvent::None);
    }

    fn add_special(&mut self, iface: InterfaceId, vid_mac: VidMac, mac_type: MacType) -> Result<()> {
        let fid = self.hal.fids.fid_for(vid_mac.vid);
        if let Some(handle) = self.table.lookup_by_fid_mac(fid, vid_mac.mac) {
            if let Some(existing) = self.table.get(handle) {
                if existing.mac_type.is_dynamic() || existing.is_zombie() {
                    self.mac_del(handle, DelReason::StationMoved, None);
                } else if existing.key.vid != vid_mac.vid {
                    return Err(PsecError::AlreadyPresentOnSharedVlan(existing.key.vid.as_u16()));
                } else if existing.key.iface != iface {
                    return Err(PsecError::AlreadyPresent(existing.key.iface));
                } else {
                    return Ok(());
                }
            }
        }
        let key = MacKey::from_vid_mac(iface, vid_mac);
        self.mac_add(key, fid, mac_type, AddOrigin::special())?;
        Ok(())
    }

    /// Handle of a visible entry, zombies excluded.
    pub(crate) fn live_handle(&self, iface: InterfaceId, vid_mac: VidMac) -> Result<EntryHandle> {
        let key = MacKey::from_vid_mac(iface, vid_mac);
        self.table
            .lookup(&key)
            .filter(|h| self.table.get(*h).is_some_and(|e| !e.is_zombie()))
            .ok_or(PsecError::EntryNotFound)
    }

    fn send(&self, node: NodeId, msg: StackMessage) {
        if node == self.local_node {
            return;
        }
        if let Err(e) = self.hal.transport.send(node, StackEnvelope::new(self.local_node, msg)) {
            warn!(node = %node, error = %e, "Stack message not sent");
        }
    }

    fn push_port_conf(&self, iface: InterfaceId, copy_to_primary: bool) {
        self.send(
            iface.node,
            StackMessage::PortConf {
                port: iface.port,
                copy_to_primary,
            },
        );
    }

    /// Full relay configuration for a (re)joining node.
    fn push_switch_conf(&self, node: NodeId) {
        let ports: BTreeSet<_> = self
            .ifaces
            .iter()
            .filter(|(iface, port)| iface.node == node && !port.enabled.is_empty())
            .map(|(iface, _)| iface.port)
            .collect();
        self.send(node, StackMessage::SwitchConf { ports });
        self.send(node, StackMessage::RateLimitConf(self.rate_limit));
    }
}
