//! The admission engine.
//!
//! One [`Engine`] value owns the MAC security table, per-interface state and
//! the pool behind a single `parking_lot::Mutex`. It is cheap to clone and is
//! handed to the management API, the frame receive path, the scheduler and
//! the dispatcher alike.

mod frame;
mod mgmt;
mod pipeline;
mod status;

pub use mgmt::{ClearFilter, PortConf};
pub use status::{Capabilities, GlobalStatus, InterfaceNotificationStatus, InterfaceStatus, MacStatus};

use crate::arbiter::PolicyTimers;
use crate::config::{PsecConfig, RateLimitConfig};
use crate::dispatcher::DeferredQueue;
use crate::error::{PsecError, Result};
use crate::hal::{Hal, Msti, RuleId};
use crate::policy::{AddNotice, DelNotice, PolicyRegistry};
use crate::stack::RateLimiter;
use crate::types::{AddMethod, MacKey, NodeRole, PolicyId, PolicySet, PortMode, VIOLATE_LIMIT_MIN};
use parking_lot::Mutex;
use psec_types::{InterfaceId, NodeId, VidMac};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Security state of one interface.
#[derive(Debug, Clone)]
pub(crate) struct InterfaceState {
    pub enabled: PolicySet,
    pub modes: [PortMode; PolicyId::COUNT],
    pub link_up: bool,
    pub limit_reached: bool,
    pub shut_down: bool,
    pub sticky: bool,
    /// Some enabled policy is in [`PortMode::KeepBlocked`].
    pub learn_frames_blocked: bool,
    /// Static MACs are being replayed; learning waits until they are in.
    pub static_add_in_progress: bool,
    /// Some enabled policy is in [`PortMode::Restrict`].
    pub keep_cpu_copy: bool,
    /// Live entries, zombies excluded.
    pub entry_count: u32,
    pub zombie_count: u32,
    pub cur_violate: u32,
    pub total_violate: u32,
    pub violate_limit: u32,
    pub latest_violator: Option<VidMac>,
    /// MST instances this port is discarding in.
    pub discarding: BTreeSet<Msti>,
    /// Last values pushed to the hardware.
    pub sec_learning: bool,
    pub cpu_copy: bool,
    pub zombie_warned_at: Option<u64>,
}

impl Default for InterfaceState {
    fn default() -> Self {
        Self {
            enabled: PolicySet::EMPTY,
            modes: [PortMode::Normal; PolicyId::COUNT],
            link_up: false,
            limit_reached: false,
            shut_down: false,
            sticky: false,
            learn_frames_blocked: false,
            static_add_in_progress: false,
            keep_cpu_copy: false,
            entry_count: 0,
            zombie_count: 0,
            cur_violate: 0,
            total_violate: 0,
            violate_limit: VIOLATE_LIMIT_MIN,
            latest_violator: None,
            discarding: BTreeSet::new(),
            sec_learning: false,
            cpu_copy: false,
            zombie_warned_at: None,
        }
    }
}

/// Everything behind the engine lock.
pub(crate) struct EngineState {
    pub hal: Hal,
    pub table: crate::table::MacTable,
    pub ifaces: BTreeMap<InterfaceId, InterfaceState>,
    pub nodes_present: [bool; NodeId::MAX as usize],
    pub timers: [PolicyTimers; PolicyId::COUNT],
    pub registry: PolicyRegistry,
    pub deferred: DeferredQueue,
    /// Seconds since start, advanced by the scheduler tick.
    pub uptime: u64,
    pub role: NodeRole,
    pub local_node: NodeId,
    pub max_nodes: u8,
    pub ports_per_node: u16,
    pub zombie_hold: u32,
    pub guard_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub limiter: RateLimiter,
    /// The per-port "check allow list" deny rule and the ports it covers.
    pub ip_port_rule: Option<RuleId>,
    pub ip_port_mask: BTreeSet<InterfaceId>,
    /// Set when the deferred queue gained work; consumed on unlock.
    pub wake_dispatcher: bool,
}

impl EngineState {
    fn new(config: &PsecConfig, hal: Hal) -> Self {
        let mut nodes_present = [false; NodeId::MAX as usize];
        nodes_present[config.engine.local_node.index()] = true;
        Self {
            hal,
            table: crate::table::MacTable::new(config.engine.pool_capacity),
            ifaces: BTreeMap::new(),
            nodes_present,
            timers: [PolicyTimers::default(); PolicyId::COUNT],
            registry: PolicyRegistry::default(),
            deferred: DeferredQueue::default(),
            uptime: 0,
            role: config.engine.role,
            local_node: config.engine.local_node,
            max_nodes: config.stack.max_nodes,
            ports_per_node: config.stack.ports_per_node,
            zombie_hold: config.engine.zombie_hold_secs,
            guard_secs: config.engine.mac_table_full_guard_secs,
            rate_limit: config.rate_limit,
            limiter: RateLimiter::new(config.rate_limit),
            ip_port_rule: None,
            ip_port_mask: BTreeSet::new(),
            wake_dispatcher: false,
        }
    }

    pub fn ensure_primary(&self) -> Result<()> {
        match self.role {
            NodeRole::Primary => Ok(()),
            NodeRole::Secondary => Err(PsecError::NotAuthorityNode),
        }
    }

    pub fn check_interface(&self, iface: InterfaceId) -> Result<()> {
        if iface.node.as_u8() > self.max_nodes || iface.port >= self.ports_per_node {
            return Err(PsecError::InvalidInterface(iface));
        }
        Ok(())
    }

    pub fn node_present(&self, node: NodeId) -> bool {
        self.nodes_present[node.index()]
    }

    /// State for `iface`, created on first use.
    pub fn iface_mut(&mut self, iface: InterfaceId) -> &mut InterfaceState {
        self.ifaces.entry(iface).or_default()
    }

    pub fn iface(&self, iface: InterfaceId) -> InterfaceState {
        self.ifaces.get(&iface).cloned().unwrap_or_default()
    }
}

struct Shared {
    state: Mutex<EngineState>,
    wake: Arc<Notify>,
}

/// Handle to the admission engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(config: &PsecConfig, hal: Hal) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new(config, hal)),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Runs `f` under the engine lock, then wakes the dispatcher if `f`
    /// queued notifications.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let (result, wake) = {
            let mut state = self.shared.state.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.wake_dispatcher))
        };
        if wake {
            self.shared.wake.notify_one();
        }
        result
    }

    /// Signal fired whenever deferred notifications are queued.
    pub fn dispatch_signal(&self) -> Arc<Notify> {
        self.shared.wake.clone()
    }

    /// Number of keys with undelivered notifications.
    pub fn pending_notifications(&self) -> usize {
        self.shared.state.lock().deferred.len()
    }

    /// Delivers every queued notification with the lock released and
    /// applies changed decisions. Returns the number of callbacks made.
    pub fn dispatch_pending(&self) -> usize {
        let (batch, registry) = {
            let mut state = self.shared.state.lock();
            (state.deferred.take(), state.registry.clone())
        };
        if batch.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut changed = Vec::new();
        for (key, op) in &batch {
            if let Some(reason) = op.del_reason {
                for policy_id in op.del.iter() {
                    let Some(policy) = registry.get(policy_id) else {
                        continue;
                    };
                    policy.on_mac_del(&DelNotice {
                        iface: key.iface,
                        vid_mac: key.vid_mac(),
                        reason,
                        method: op.del_methods[policy_id.index()],
                        originating: op.del_originating,
                    });
                    delivered += 1;
                }
            }
            for policy_id in op.add.iter() {
                let Some(policy) = registry.get(policy_id) else {
                    continue;
                };
                let verdict = policy.on_mac_add(&AddNotice {
                    iface: key.iface,
                    vid_mac: key.vid_mac(),
                    entry_count_before: op.entry_count_before,
                    originating: op.add_originating,
                });
                delivered += 1;
                changed.push((*key, op.generation, policy_id, verdict.method));
            }
        }

        if !changed.is_empty() {
            self.with_state(|state| {
                for (key, generation, policy_id, method) in changed {
                    state.apply_deferred_decision(key, generation, policy_id, method);
                }
            });
        }
        delivered
    }
}

impl EngineState {
    /// Writes back a decision returned by a deferred add callback, unless the
    /// entry was deleted or re-created while the lock was released.
    fn apply_deferred_decision(&mut self, key: MacKey, generation: u64, policy: PolicyId, method: AddMethod) {
        let Some(handle) = self.table.lookup(&key) else {
            debug!(key = %key, policy = %policy, "Entry gone before deferred decision arrived");
            return;
        };
        let Some(entry) = self.table.get_mut(handle) else {
            return;
        };
        if entry.generation() != generation || entry.is_zombie() {
            debug!(key = %key, policy = %policy, "Stale deferred decision dropped");
            return;
        }
        if entry.decision(policy) == method {
            return;
        }
        entry.set_decision(policy, method);
        self.mac_chg(handle, false);
    }
}
