//! Read-only views of the engine state. Zombies never show up here.

use super::{Engine, EngineState, InterfaceState};
use crate::error::{PsecError, Result};
use crate::table::MacEntry;
use crate::types::{
    AddMethod, MacKey, MacType, PolicyId, PolicySet, PortMode, AGING_PERIOD_MAX, AGING_PERIOD_MIN,
    HOLD_TIME_MAX, HOLD_TIME_MIN, LIMIT_MAX, LIMIT_MIN, VIOLATE_LIMIT_MAX, VIOLATE_LIMIT_MIN,
};
use chrono::{DateTime, Utc};
use psec_types::{InterfaceId, VidMac, VlanId};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub registered: PolicySet,
    pub pool_capacity: usize,
    pub max_nodes: u8,
    pub ports_per_node: u16,
    pub aging_period_min: u32,
    pub aging_period_max: u32,
    pub hold_time_min: u32,
    pub hold_time_max: u32,
    pub violate_limit_min: u32,
    pub violate_limit_max: u32,
    pub limit_min: u32,
    pub limit_max: u32,
    pub zombie_hold_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalStatus {
    pub pool_capacity: usize,
    pub pool_free: usize,
    pub uptime_secs: u64,
    /// Keys with undelivered policy notifications.
    pub pending_notifications: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    pub enabled: PolicySet,
    pub modes: BTreeMap<PolicyId, PortMode>,
    pub link_up: bool,
    pub limit_reached: bool,
    pub shut_down: bool,
    pub sticky: bool,
    pub sec_learning: bool,
    pub cpu_copy: bool,
    pub mac_count: u32,
    pub cur_violate: u32,
    pub total_violate: u32,
    pub violate_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceNotificationStatus {
    pub shut_down: bool,
    pub total_violate: u32,
    pub latest_violator: Option<VidMac>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacStatus {
    pub iface: InterfaceId,
    pub vid_mac: VidMac,
    pub fid: VlanId,
    pub mac_type: MacType,
    pub blocked: bool,
    pub kept_blocked: bool,
    pub violating: bool,
    pub cpu_copying: bool,
    /// Seconds left of the age or hold period; 0 when not counting.
    pub age_or_hold_left: u32,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub forward: PolicySet,
    pub block: PolicySet,
    pub keep_blocked: PolicySet,
}

impl MacStatus {
    fn from_entry(entry: &MacEntry, enabled: PolicySet) -> Self {
        let with = |method: AddMethod| -> PolicySet { enabled.iter().filter(|p| entry.decision(*p) == method).collect() };
        Self {
            iface: entry.key.iface,
            vid_mac: entry.key.vid_mac(),
            fid: entry.fid,
            mac_type: entry.mac_type,
            blocked: entry.blocked,
            kept_blocked: entry.kept_blocked,
            violating: entry.violating,
            cpu_copying: entry.cpu_copying,
            age_or_hold_left: entry.counter,
            created_at: entry.created_at,
            changed_at: entry.changed_at,
            forward: with(AddMethod::Forward),
            block: with(AddMethod::Block),
            keep_blocked: with(AddMethod::KeepBlocked),
        }
    }
}

impl InterfaceStatus {
    fn from_state(port: &InterfaceState) -> Self {
        Self {
            enabled: port.enabled,
            modes: port.enabled.iter().map(|p| (p, port.modes[p.index()])).collect(),
            link_up: port.link_up,
            limit_reached: port.limit_reached,
            shut_down: port.shut_down,
            sticky: port.sticky,
            sec_learning: port.sec_learning,
            cpu_copy: port.cpu_copy,
            mac_count: port.entry_count,
            cur_violate: port.cur_violate,
            total_violate: port.total_violate,
            violate_limit: port.violate_limit,
        }
    }
}

impl EngineState {
    fn mac_status_of(&self, key: &MacKey) -> Option<MacStatus> {
        let entry = self.table.entry(key)?;
        if entry.is_zombie() {
            return None;
        }
        Some(MacStatus::from_entry(entry, self.iface(key.iface).enabled))
    }
}

impl Engine {
    pub fn capabilities(&self) -> Capabilities {
        self.with_state(|state| Capabilities {
            registered: state.registry.registered(),
            pool_capacity: state.table.capacity(),
            max_nodes: state.max_nodes,
            ports_per_node: state.ports_per_node,
            aging_period_min: AGING_PERIOD_MIN,
            aging_period_max: AGING_PERIOD_MAX,
            hold_time_min: HOLD_TIME_MIN,
            hold_time_max: HOLD_TIME_MAX,
            violate_limit_min: VIOLATE_LIMIT_MIN,
            violate_limit_max: VIOLATE_LIMIT_MAX,
            limit_min: LIMIT_MIN,
            limit_max: LIMIT_MAX,
            zombie_hold_secs: state.zombie_hold,
        })
    }

    pub fn global_status(&self) -> GlobalStatus {
        self.with_state(|state| GlobalStatus {
            pool_capacity: state.table.capacity(),
            pool_free: state.table.free_count(),
            uptime_secs: state.uptime,
            pending_notifications: state.deferred.len(),
        })
    }

    pub fn interface_status(&self, iface: InterfaceId) -> Result<InterfaceStatus> {
        self.with_state(|state| {
            state.check_interface(iface)?;
            Ok(InterfaceStatus::from_state(&state.iface(iface)))
        })
    }

    pub fn interface_notification_status(&self, iface: InterfaceId) -> Result<InterfaceNotificationStatus> {
        self.with_state(|state| {
            state.check_interface(iface)?;
            let port = state.iface(iface);
            Ok(InterfaceNotificationStatus {
                shut_down: port.shut_down,
                total_violate: port.total_violate,
                latest_violator: port.latest_violator,
            })
        })
    }

    pub fn mac_status(&self, iface: InterfaceId, vid_mac: VidMac) -> Result<MacStatus> {
        self.with_state(|state| {
            state
                .mac_status_of(&MacKey::from_vid_mac(iface, vid_mac))
                .ok_or(PsecError::EntryNotFound)
        })
    }

    /// The first visible entry ordered after `after`, or the very first one.
    pub fn mac_status_iter(&self, after: Option<MacKey>) -> Option<MacStatus> {
        self.with_state(|state| {
            let mut cursor = after;
            loop {
                let key = state.table.next_key(cursor.as_ref())?;
                if let Some(status) = state.mac_status_of(&key) {
                    return Some(status);
                }
                cursor = Some(key);
            }
        })
    }

    /// Every visible entry, optionally limited to one interface.
    pub fn mac_status_all(&self, iface: Option<InterfaceId>) -> Vec<MacStatus> {
        self.with_state(|state| {
            state
                .table
                .iter()
                .filter(|e| !e.is_zombie() && iface.is_none_or(|i| i == e.key.iface))
                .map(|e| MacStatus::from_entry(e, state.iface(e.key.iface).enabled))
                .collect()
        })
    }
}
