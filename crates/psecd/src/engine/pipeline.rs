//! Admission pipeline: add, change and delete of table entries, and the
//! secure-learning state that follows from them.
//!
//! Everything here runs with the engine lock held.

use super::EngineState;
use crate::arbiter;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{HalError, PsecError, Result};
use crate::hal::{DenyAction, DenyRule, HwMacEntry, PortMask};
use crate::policy::{AddNotice, DelNotice};
use crate::table::{EntryHandle, MacEntry};
use crate::types::{AddAction, AddMethod, DelReason, MacKey, MacType, PolicyId, PolicySet, PortMode};
use chrono::Utc;
use psec_types::{InterfaceId, VlanId};
use tracing::{debug, error, info, warn};

/// Who asked for an add and what it decided up front.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AddOrigin {
    /// Policy whose decision is already known and which is not called back.
    pub decided: Option<(PolicyId, AddMethod)>,
    /// Reported to the admin policy as the originating policy.
    pub notice: Option<PolicyId>,
    /// Skips the spanning tree, link and shut-down checks.
    pub forced: bool,
}

impl AddOrigin {
    pub fn learned() -> Self {
        Self::default()
    }

    pub fn explicit(policy: PolicyId, method: AddMethod) -> Self {
        Self {
            decided: Some((policy, method)),
            notice: Some(policy),
            forced: false,
        }
    }

    pub fn special() -> Self {
        Self {
            decided: None,
            notice: Some(PolicyId::Admin),
            forced: true,
        }
    }

    fn skip(&self) -> Option<PolicyId> {
        self.decided.map(|(p, _)| p)
    }
}

/// Pool movement that may flip the depleted state for every port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolEvent {
    None,
    Allocated,
    Freed,
}

impl EngineState {
    /// Admits `key` into the table and programs the hardware.
    pub(crate) fn mac_add(
        &mut self,
        key: MacKey,
        fid: VlanId,
        mac_type: MacType,
        origin: AddOrigin,
    ) -> Result<EntryHandle> {
        let iface = key.iface;
        self.ensure_primary()?;
        if !self.node_present(iface.node) {
            return Err(PsecError::NodeDown(iface.node));
        }

        let port = self.iface(iface);
        if !origin.forced {
            let msti = self.hal.stp.msti_for_vlan(key.vid);
            if port.discarding.contains(&msti) {
                return Err(PsecError::SpanningTreeDiscarding(iface));
            }
            if !port.link_up {
                return Err(PsecError::LinkDown(iface));
            }
        }
        if port.limit_reached && !(port.keep_cpu_copy && port.cur_violate < port.violate_limit) {
            return Err(PsecError::LimitReached(iface));
        }
        if port.shut_down && !origin.forced {
            return Err(PsecError::PortShutDown(iface));
        }
        if port.enabled.is_empty() {
            return Err(PsecError::NoPoliciesEnabled(iface));
        }

        let handle = self.table.allocate(key, fid, self.uptime)?;
        if let Some(entry) = self.table.get_mut(handle) {
            entry.mac_type = mac_type;
        }
        self.iface_mut(iface).entry_count += 1;

        match self.add_callback(handle, origin) {
            AddAction::ShutDown => {
                let port = self.iface_mut(iface);
                port.shut_down = true;
                port.limit_reached = false;
                audit_log!(AuditRecord::new(AuditCategory::Violation, "psec", "port_shut_down")
                    .with_outcome(AuditOutcome::Denied)
                    .with_object_id(iface.to_string())
                    .with_object_type("interface")
                    .with_details(serde_json::json!({ "vid": key.vid, "mac": key.mac.to_string() })));
                self.del_all(iface, DelReason::PortShutDown, origin.skip(), false);
                self.cpu_copy_check(iface, PoolEvent::None);
                return Err(PsecError::PortShutDown(iface));
            }
            AddAction::LimitReached => self.iface_mut(iface).limit_reached = true,
            AddAction::None => self.iface_mut(iface).limit_reached = false,
        }

        match self.mac_chg(handle, false) {
            Ok(()) => {
                self.cpu_copy_check(iface, PoolEvent::Allocated);
                Ok(handle)
            }
            Err(e) => {
                self.mac_del(handle, hw_failure_reason(&e), origin.skip());
                Err(PsecError::Internal(format!("{key}: {e}")))
            }
        }
    }

    /// Collects a decision from every enabled policy. Returns the admin
    /// policy's action.
    fn add_callback(&mut self, handle: EntryHandle, origin: AddOrigin) -> AddAction {
        let Some(entry) = self.table.get(handle) else {
            return AddAction::None;
        };
        let key = entry.key;
        let generation = entry.generation();
        let port = self.iface(key.iface);
        let entry_count_before = port.entry_count.saturating_sub(1);

        let mut action = AddAction::None;
        let mut deferred = PolicySet::EMPTY;
        for policy_id in port.enabled.iter() {
            let Some(policy) = self.registry.get(policy_id) else {
                continue;
            };

            let method = if let Some((decided, method)) = origin.decided.filter(|(p, _)| *p == policy_id) {
                debug!(key = %key, policy = %decided, method = %method, "Decision given by requester");
                method
            } else if policy_id == PolicyId::Admin {
                let verdict = policy.on_mac_add(&AddNotice {
                    iface: key.iface,
                    vid_mac: key.vid_mac(),
                    entry_count_before,
                    originating: origin.notice,
                });
                action = verdict.action;
                if port.modes[PolicyId::Admin.index()] == PortMode::Restrict && verdict.method == AddMethod::Block {
                    self.record_violation(handle, verdict.action);
                }
                verdict.method
            } else {
                deferred.insert(policy_id);
                AddMethod::KeepBlocked
            };

            if let Some(entry) = self.table.get_mut(handle) {
                entry.set_decision(policy_id, method);
            }
        }

        if !deferred.is_empty() {
            match self
                .deferred
                .enqueue_add(key, deferred, generation, entry_count_before, origin.notice)
            {
                Ok(()) => self.wake_dispatcher = true,
                Err(e) => error!(key = %key, error = %e, "Failed to queue add notification"),
            }
        }
        action
    }

    fn record_violation(&mut self, handle: EntryHandle, action: AddAction) {
        let Some(entry) = self.table.get_mut(handle) else {
            return;
        };
        let key = entry.key;
        match action {
            AddAction::LimitReached => {
                entry.violating = true;
                entry.mac_type = MacType::Dynamic;
                let port = self.iface_mut(key.iface);
                port.cur_violate += 1;
                port.total_violate += 1;
                port.latest_violator = Some(key.vid_mac());
                let violations = port.cur_violate;
                info!(
                    interface = %key.iface,
                    vid = %key.vid,
                    mac = %key.mac,
                    violations,
                    "Violating MAC address blocked"
                );
                audit_log!(AuditRecord::new(AuditCategory::Violation, "psec", "mac_blocked")
                    .with_outcome(AuditOutcome::Denied)
                    .with_object_id(key.iface.to_string())
                    .with_object_type("interface")
                    .with_details(serde_json::json!({
                        "vid": key.vid,
                        "mac": key.mac.to_string(),
                        "violations": violations,
                    })));
            }
            AddAction::ShutDown => {
                entry.mac_type = MacType::Dynamic;
                self.iface_mut(key.iface).latest_violator = Some(key.vid_mac());
            }
            AddAction::None => {}
        }
    }

    /// Re-arbitrates an entry and rewrites the hardware entry if needed.
    pub(crate) fn mac_chg(&mut self, handle: EntryHandle, times_only: bool) -> std::result::Result<(), HalError> {
        let Some(entry) = self.table.get(handle) else {
            error!("Internal error: arbitration on a non-existent entry");
            return Ok(());
        };
        if entry.is_zombie() {
            return Ok(());
        }
        let enabled = self.iface(entry.key.iface).enabled;
        let arb = arbiter::arbitrate(enabled, &entry.decisions, &self.timers, entry.mac_type);

        let Some(entry) = self.table.get_mut(handle) else {
            return Ok(());
        };
        let was_blocked = entry.blocked;
        let rewrite = arbiter::apply(entry, &arb, times_only) || !entry.in_hw;
        if rewrite || was_blocked != entry.blocked {
            entry.changed_at = Utc::now();
        }
        if rewrite {
            self.hw_write(handle)?;
            self.ip_filter_sync(handle);
        }
        Ok(())
    }

    /// Like [`EngineState::mac_chg`], but a hardware failure turns the entry
    /// into a zombie.
    pub(crate) fn mac_chg_or_zombie(&mut self, handle: EntryHandle, times_only: bool) {
        if let Err(e) = self.mac_chg(handle, times_only) {
            self.mac_del(handle, hw_failure_reason(&e), None);
        }
    }

    /// Writes the entry's current state to the hardware MAC table.
    pub(crate) fn hw_write(&mut self, handle: EntryHandle) -> std::result::Result<(), HalError> {
        let Some(entry) = self.table.get(handle) else {
            return Ok(());
        };
        let hw = HwMacEntry {
            fid: entry.fid,
            mac: entry.key.mac,
            destination: (!entry.blocked).then_some(entry.key.iface),
            copy_to_cpu: entry.cpu_copying,
            locked: true,
        };
        self.hal.mac_table.add(&hw)?;
        if let Some(entry) = self.table.get_mut(handle) {
            entry.in_hw = true;
        }
        Ok(())
    }

    pub(crate) fn hw_write_or_zombie(&mut self, handle: EntryHandle) {
        if let Err(e) = self.hw_write(handle) {
            self.mac_del(handle, hw_failure_reason(&e), None);
        }
    }

    fn hw_remove(&mut self, handle: EntryHandle) {
        let Some(entry) = self.table.get_mut(handle) else {
            return;
        };
        if !entry.in_hw {
            return;
        }
        entry.in_hw = false;
        let (key, fid) = (entry.key, entry.fid);
        if !self.node_present(key.iface.node) {
            return;
        }
        if let Err(e) = self.hal.mac_table.delete(fid, key.mac) {
            debug!(key = %key, error = %e, "Hardware MAC delete failed");
        }
    }

    /// Mirrors the entry's forwarding state into the IP admission filter.
    fn ip_filter_sync(&mut self, handle: EntryHandle) {
        let Some(entry) = self.table.get(handle) else {
            return;
        };
        let key = entry.key;
        let mut rules = entry.ip_rules;
        let filter = self.hal.ip_filter.clone();

        let ports = if entry.blocked {
            if let Some(id) = rules.allow.take() {
                if let Err(e) = filter.rule_del(id) {
                    warn!(key = %key, error = %e, "Failed to remove IP allow rule");
                }
            }
            PortMask::All
        } else {
            if rules.allow.is_none() {
                match filter.allow_list_add(key.mac, key.vid) {
                    Ok(id) => rules.allow = Some(id),
                    Err(e) => warn!(key = %key, error = %e, "Failed to add IP allow rule"),
                }
            }
            PortMask::AllExcept(key.iface)
        };

        let deny = DenyRule {
            mac: Some(key.mac),
            vid: Some(key.vid),
            ports,
            action: DenyAction::Drop,
        };
        match rules.deny {
            Some(id) => {
                if let Err(e) = filter.rule_update(id, deny) {
                    warn!(key = %key, error = %e, "Failed to update IP deny rule");
                }
            }
            None => match filter.deny_list_add(deny) {
                Ok(id) => rules.deny = Some(id),
                Err(e) => warn!(key = %key, error = %e, "Failed to add IP deny rule"),
            },
        }

        if let Some(entry) = self.table.get_mut(handle) {
            entry.ip_rules = rules;
        }
    }

    fn ip_filter_remove(&mut self, handle: EntryHandle) {
        let Some(entry) = self.table.get_mut(handle) else {
            return;
        };
        let key = entry.key;
        let rules = std::mem::take(&mut entry.ip_rules);
        for id in [rules.allow, rules.deny].into_iter().flatten() {
            if let Err(e) = self.hal.ip_filter.rule_del(id) {
                warn!(key = %key, error = %e, "Failed to remove IP filter rule");
            }
        }
    }

    /// Removes an entry. `skip` is a policy that asked for the delete and
    /// gets no notification.
    pub(crate) fn mac_del(&mut self, handle: EntryHandle, reason: DelReason, skip: Option<PolicyId>) {
        let Some(entry) = self.table.get(handle).cloned() else {
            return;
        };
        let key = entry.key;
        let iface = key.iface;

        if entry.is_zombie() {
            let port = self.iface_mut(iface);
            port.zombie_count = port.zombie_count.saturating_sub(1);
            self.table.free(handle);
            debug!(key = %key, "Zombie entry released");
            self.cpu_copy_check(iface, PoolEvent::Freed);
            return;
        }

        self.del_callback(&entry, reason, skip);

        let port = self.iface_mut(iface);
        if entry.violating {
            if port.cur_violate == 0 {
                error!(interface = %iface, "Internal error: violation count underflow");
            } else {
                port.cur_violate -= 1;
            }
        } else {
            port.limit_reached = false;
        }

        self.hw_remove(handle);
        self.ip_filter_remove(handle);
        let port = self.iface_mut(iface);
        port.entry_count = port.entry_count.saturating_sub(1);

        if reason.makes_zombie() {
            let hold = self.zombie_hold;
            let uptime = self.uptime;
            if let Some(zombie) = self.table.get_mut(handle) {
                zombie.hw_add_failed = reason == DelReason::HwAddFailed;
                zombie.sw_add_failed = reason == DelReason::SwAddFailed;
                zombie.blocked = true;
                zombie.kept_blocked = false;
                zombie.cpu_copying = false;
                zombie.counter = hold;
                zombie.changed_at = Utc::now();
            }
            let port = self.iface_mut(iface);
            port.zombie_count += 1;
            // Once per zombie window per interface.
            let warn_due = port
                .zombie_warned_at
                .is_none_or(|at| uptime.saturating_sub(at) >= u64::from(hold));
            if warn_due {
                port.zombie_warned_at = Some(uptime);
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "psec", "mac_add_failed")
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(key.to_string())
                    .with_object_type("mac")
                    .with_error(reason.to_string()));
            }
            self.cpu_copy_check(iface, PoolEvent::None);
            return;
        }

        self.table.free(handle);
        debug!(key = %key, reason = %reason, "MAC entry deleted");
        self.cpu_copy_check(iface, PoolEvent::Freed);
    }

    fn del_callback(&mut self, entry: &MacEntry, reason: DelReason, skip: Option<PolicyId>) {
        let key = entry.key;
        let enabled = self.iface(key.iface).enabled;
        let mut deferred = PolicySet::EMPTY;
        for policy_id in enabled.iter().filter(|p| Some(*p) != skip) {
            let Some(policy) = self.registry.get(policy_id) else {
                continue;
            };
            if policy_id == PolicyId::Admin {
                policy.on_mac_del(&DelNotice {
                    iface: key.iface,
                    vid_mac: key.vid_mac(),
                    reason,
                    method: entry.decision(PolicyId::Admin),
                    originating: skip,
                });
            } else {
                deferred.insert(policy_id);
            }
        }

        if deferred.is_empty() {
            return;
        }
        match self
            .deferred
            .enqueue_del(key, deferred, reason, &entry.decisions, skip)
        {
            Ok(()) => self.wake_dispatcher = true,
            Err(e) => error!(key = %key, error = %e, "Failed to queue delete notification"),
        }
    }

    /// Deletes every entry on `iface`, static and sticky ones too unless
    /// `keep_static` is set.
    pub(crate) fn del_all(&mut self, iface: InterfaceId, reason: DelReason, skip: Option<PolicyId>, keep_static: bool) {
        for handle in self.table.handles_on(iface) {
            let Some(entry) = self.table.get(handle) else {
                continue;
            };
            if keep_static && !entry.mac_type.is_dynamic() && !entry.is_zombie() {
                continue;
            }
            self.mac_del(handle, reason, skip);
        }
    }

    /// Re-evaluates secure learning and CPU copy for `iface`, and for every
    /// interface when the pool just ran dry or just got a slot back.
    pub(crate) fn cpu_copy_check(&mut self, iface: InterfaceId, event: PoolEvent) {
        let free = self.table.free_count();
        let all = match event {
            PoolEvent::Allocated => free == 0,
            PoolEvent::Freed => free == 1,
            PoolEvent::None => false,
        };
        if all {
            let ifaces: Vec<InterfaceId> = self.ifaces.keys().copied().collect();
            for other in ifaces {
                self.update_port_learning(other);
            }
        } else {
            self.update_port_learning(iface);
        }
    }

    fn update_port_learning(&mut self, iface: InterfaceId) {
        let node_present = self.node_present(iface.node);
        let pool_empty = self.table.free_count() == 0;
        let Some(port) = self.ifaces.get_mut(&iface) else {
            return;
        };

        let sec_learning = node_present && port.link_up && !port.enabled.is_empty();
        let limit_disable = port.limit_reached && (!port.keep_cpu_copy || port.cur_violate >= port.violate_limit);
        let cpu_copy = sec_learning
            && !(limit_disable
                || port.shut_down
                || port.zombie_count > 0
                || port.learn_frames_blocked
                || port.static_add_in_progress
                || pool_empty);

        if (sec_learning, cpu_copy) == (port.sec_learning, port.cpu_copy) {
            return;
        }
        port.sec_learning = sec_learning;
        port.cpu_copy = cpu_copy;
        debug!(interface = %iface, sec_learning, cpu_copy, "Secure learning changed");

        if node_present {
            if let Err(e) = self.hal.mac_table.set_secure_learning(iface, sec_learning, cpu_copy) {
                warn!(interface = %iface, error = %e, "Failed to set secure learning");
            }
        }

        let changed = if sec_learning {
            self.ip_port_mask.insert(iface)
        } else {
            self.ip_port_mask.remove(&iface)
        };
        if changed {
            self.ip_port_rule_sync();
        }
    }

    /// Keeps the single check-allow-list rule in line with the set of ports
    /// running secure learning.
    fn ip_port_rule_sync(&mut self) {
        let filter = self.hal.ip_filter.clone();
        if self.ip_port_mask.is_empty() {
            if let Some(id) = self.ip_port_rule.take() {
                if let Err(e) = filter.rule_del(id) {
                    warn!(error = %e, "Failed to remove IP port rule");
                }
            }
            return;
        }

        let rule = DenyRule {
            mac: None,
            vid: None,
            ports: PortMask::Only(self.ip_port_mask.clone()),
            action: DenyAction::CheckAllowList,
        };
        match self.ip_port_rule {
            Some(id) => {
                if let Err(e) = filter.rule_update(id, rule) {
                    warn!(error = %e, "Failed to update IP port rule");
                }
            }
            None => match filter.deny_list_add(rule) {
                Ok(id) => self.ip_port_rule = Some(id),
                Err(e) => warn!(error = %e, "Failed to add IP port rule"),
            },
        }
    }
}

/// A full hardware table keeps the slot as a hardware zombie; anything else
/// never made it that far.
pub(crate) fn hw_failure_reason(err: &HalError) -> DelReason {
    match err {
        HalError::TableFull => DelReason::HwAddFailed,
        HalError::Failed(_) => DelReason::SwAddFailed,
    }
}
