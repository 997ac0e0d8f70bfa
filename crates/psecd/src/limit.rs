//! Limit control: the administrative port-security policy.
//!
//! Caps the number of forwarding MAC addresses per interface and reacts to
//! violations by protecting (silently blocking), restricting (blocking and
//! counting) or shutting the port down. It also owns the configured static
//! and sticky MAC addresses and replays them into the engine.
//!
//! [`LimitPolicy`] is the callback side registered as [`PolicyId::Admin`];
//! the engine calls it with its lock held, so it never calls back into the
//! engine. [`LimitControl`] is the management side and talks to the engine
//! with the policy's own lock released.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::LimitConfig;
use crate::engine::{Engine, PortConf};
use crate::error::{PsecError, Result};
use crate::policy::{AddNotice, AddVerdict, DelNotice, SecurityPolicy, StaticMac};
use crate::types::{
    AddAction, AddMethod, MacType, PolicyId, PortMode, AGING_PERIOD_MAX, AGING_PERIOD_MIN,
    HOLD_TIME_MAX, HOLD_TIME_MIN, LIMIT_MAX, LIMIT_MIN, VIOLATE_LIMIT_MAX, VIOLATE_LIMIT_MIN,
};
use parking_lot::Mutex;
use psec_types::{InterfaceId, VidMac};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What to do when a MAC address beyond the limit shows up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationMode {
    /// Block the newcomer, stop copying learn frames to the CPU.
    #[default]
    Protect,
    /// Block the newcomer and keep counting violators up to the violation limit.
    Restrict,
    /// Shut the port down.
    Shutdown,
}

impl ViolationMode {
    /// Restrict and Shutdown both need learn frames past the limit.
    pub const fn port_mode(self) -> PortMode {
        match self {
            ViolationMode::Protect => PortMode::Normal,
            ViolationMode::Restrict | ViolationMode::Shutdown => PortMode::Restrict,
        }
    }
}

/// Per-interface limit control configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConf {
    pub enabled: bool,
    pub limit: u32,
    pub violation_mode: ViolationMode,
    pub violate_limit: u32,
    pub sticky: bool,
}

impl InterfaceConf {
    pub fn from_config(cfg: &LimitConfig) -> Self {
        Self {
            enabled: false,
            limit: cfg.default_limit,
            violation_mode: cfg.default_violation_mode,
            violate_limit: cfg.default_violate_limit,
            sticky: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(LIMIT_MIN..=LIMIT_MAX).contains(&self.limit) {
            return Err(PsecError::InvalidParameter(format!(
                "limit {} is out of bounds ([{LIMIT_MIN}; {LIMIT_MAX}])",
                self.limit
            )));
        }
        if !(VIOLATE_LIMIT_MIN..=VIOLATE_LIMIT_MAX).contains(&self.violate_limit) {
            return Err(PsecError::InvalidViolationLimit(self.violate_limit));
        }
        Ok(())
    }
}

/// Aging and hold configuration shared by all interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConf {
    pub aging_enabled: bool,
    pub aging_period_secs: u32,
    pub hold_time_secs: u32,
}

impl GlobalConf {
    pub fn from_config(cfg: &LimitConfig) -> Self {
        Self {
            aging_enabled: cfg.aging_enabled,
            aging_period_secs: cfg.aging_period_secs,
            hold_time_secs: cfg.hold_time_secs,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(AGING_PERIOD_MIN..=AGING_PERIOD_MAX).contains(&self.aging_period_secs) {
            return Err(PsecError::InvalidAgingPeriod(self.aging_period_secs));
        }
        if !(HOLD_TIME_MIN..=HOLD_TIME_MAX).contains(&self.hold_time_secs) {
            return Err(PsecError::InvalidHoldTime(self.hold_time_secs));
        }
        Ok(())
    }

    fn effective_aging(&self) -> u32 {
        if self.aging_enabled {
            self.aging_period_secs
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
struct PortState {
    conf: InterfaceConf,
    fwd_cnt: u32,
    blk_cnt: u32,
    macs: BTreeMap<VidMac, MacType>,
}

impl PortState {
    fn new(conf: InterfaceConf) -> Self {
        Self {
            conf,
            fwd_cnt: 0,
            blk_cnt: 0,
            macs: BTreeMap::new(),
        }
    }
}

/// Callback half of limit control, registered with the engine.
pub struct LimitPolicy {
    defaults: InterfaceConf,
    ports: Mutex<BTreeMap<InterfaceId, PortState>>,
}

impl LimitPolicy {
    pub fn new(defaults: InterfaceConf) -> Self {
        Self {
            defaults,
            ports: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_port<R>(&self, iface: InterfaceId, f: impl FnOnce(&mut PortState) -> R) -> R {
        let mut ports = self.ports.lock();
        let port = ports
            .entry(iface)
            .or_insert_with(|| PortState::new(self.defaults));
        f(port)
    }

    /// Decides a new MAC against the limit and bumps the matching count.
    fn decide(port: &mut PortState, vid_mac: VidMac) -> AddVerdict {
        let limit = port.conf.limit;
        let fwd = port.fwd_cnt;

        let action = match port.conf.violation_mode {
            ViolationMode::Protect | ViolationMode::Restrict => {
                if fwd + 1 >= limit {
                    AddAction::LimitReached
                } else {
                    AddAction::None
                }
            }
            ViolationMode::Shutdown => {
                if fwd + 1 == limit {
                    AddAction::LimitReached
                } else if fwd == limit {
                    AddAction::ShutDown
                } else {
                    AddAction::None
                }
            }
        };

        let method = if fwd < limit {
            AddMethod::Forward
        } else {
            AddMethod::Block
        };

        match method {
            AddMethod::Forward => {
                port.fwd_cnt += 1;
                if port.conf.sticky {
                    port.macs.entry(vid_mac).or_insert(MacType::Sticky);
                }
            }
            _ => port.blk_cnt += 1,
        }

        AddVerdict::with_action(method, action)
    }
}

impl SecurityPolicy for LimitPolicy {
    fn on_mac_add(&self, notice: &AddNotice) -> AddVerdict {
        self.with_port(notice.iface, |port| {
            if !port.conf.enabled && notice.originating != Some(PolicyId::Admin) {
                return AddVerdict::new(AddMethod::Forward);
            }
            if port.fwd_cnt + port.blk_cnt != notice.entry_count_before {
                debug!(
                    interface = %notice.iface,
                    entry_count = notice.entry_count_before,
                    fwd = port.fwd_cnt,
                    blk = port.blk_cnt,
                    "Entry count disagrees with limit reference counts"
                );
            }
            let verdict = Self::decide(port, notice.vid_mac);
            if verdict.action == AddAction::ShutDown {
                warn!(interface = %notice.iface, mac = %notice.vid_mac.mac, "Limit exceeded, shutting down the port");
            } else if verdict.action == AddAction::LimitReached && verdict.method == AddMethod::Forward {
                info!(interface = %notice.iface, limit = port.conf.limit, "Limit reached");
            }
            verdict
        })
    }

    fn on_mac_del(&self, notice: &DelNotice) {
        self.with_port(notice.iface, |port| {
            let count = match notice.method {
                AddMethod::Forward => &mut port.fwd_cnt,
                AddMethod::Block => &mut port.blk_cnt,
                AddMethod::KeepBlocked => {
                    error!(interface = %notice.iface, "Delete notice for an unsupported add method");
                    return;
                }
            };
            if *count == 0 {
                error!(
                    interface = %notice.iface,
                    method = %notice.method,
                    "Internal error: reference count underflow"
                );
                return;
            }
            *count -= 1;
        })
    }

    fn static_entries(&self, iface: InterfaceId) -> Vec<StaticMac> {
        self.ports
            .lock()
            .get(&iface)
            .filter(|port| port.conf.enabled)
            .map(|port| {
                port.macs
                    .iter()
                    .map(|(vid_mac, mac_type)| StaticMac {
                        vid_mac: *vid_mac,
                        mac_type: *mac_type,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn on_sticky_change(&self, iface: InterfaceId, vid_mac: VidMac, mac_type: MacType) {
        self.with_port(iface, |port| match mac_type {
            MacType::Sticky => {
                port.macs.entry(vid_mac).or_insert(MacType::Sticky);
            }
            MacType::Dynamic => {
                if port.macs.get(&vid_mac) == Some(&MacType::Sticky) {
                    port.macs.remove(&vid_mac);
                }
            }
            MacType::Static => {}
        })
    }
}

/// Management side of limit control.
pub struct LimitControl {
    engine: Engine,
    policy: Arc<LimitPolicy>,
    global: Mutex<GlobalConf>,
}

impl LimitControl {
    /// Registers limit control as the admin policy and applies `cfg`'s
    /// global timers.
    pub fn attach(engine: Engine, cfg: &LimitConfig) -> Result<Self> {
        let policy = Arc::new(LimitPolicy::new(InterfaceConf::from_config(cfg)));
        engine.register(PolicyId::Admin, policy.clone())?;
        let control = Self {
            engine,
            policy,
            global: Mutex::new(GlobalConf::from_config(cfg)),
        };
        let global = *control.global.lock();
        control.global_conf_set(global)?;
        Ok(control)
    }

    pub fn global_conf(&self) -> GlobalConf {
        *self.global.lock()
    }

    pub fn global_conf_set(&self, conf: GlobalConf) -> Result<()> {
        conf.validate()?;
        self.engine
            .set_timers(PolicyId::Admin, conf.effective_aging(), conf.hold_time_secs)?;
        *self.global.lock() = conf;
        Ok(())
    }

    pub fn interface_conf(&self, iface: InterfaceId) -> InterfaceConf {
        self.policy.with_port(iface, |port| port.conf)
    }

    /// Forwarding and blocked reference counts.
    pub fn ref_counts(&self, iface: InterfaceId) -> (u32, u32) {
        self.policy.with_port(iface, |port| (port.fwd_cnt, port.blk_cnt))
    }

    /// Configured static and learned sticky MACs on `iface`.
    pub fn macs(&self, iface: InterfaceId) -> Vec<StaticMac> {
        self.policy.with_port(iface, |port| {
            port.macs
                .iter()
                .map(|(vid_mac, mac_type)| StaticMac {
                    vid_mac: *vid_mac,
                    mac_type: *mac_type,
                })
                .collect()
        })
    }

    pub fn interface_conf_set(&self, iface: InterfaceId, conf: InterfaceConf) -> Result<()> {
        conf.validate()?;
        self.engine.check_interface(iface)?;

        enum Apply {
            Nothing,
            Enable { reopen: bool },
            Sticky,
        }

        let (old, apply) = self.policy.with_port(iface, |port| {
            let current = if port.conf.enabled {
                port.fwd_cnt
            } else {
                port.macs.len() as u32
            };
            if conf.limit < current {
                return Err(PsecError::LimitLowerThanCurrentCount {
                    limit: conf.limit,
                    current,
                });
            }

            let old = port.clone();
            if !conf.sticky {
                port.macs.retain(|_, mac_type| *mac_type != MacType::Sticky);
            }

            let apply = match (old.conf.enabled, conf.enabled) {
                (false, true) => Apply::Enable { reopen: false },
                (true, false) => Apply::Enable { reopen: true },
                (true, true)
                    if conf.limit != old.conf.limit
                        || conf.violation_mode != old.conf.violation_mode
                        || conf.violate_limit != old.conf.violate_limit =>
                {
                    Apply::Enable { reopen: true }
                }
                (true, true) if conf.sticky != old.conf.sticky => Apply::Sticky,
                _ => Apply::Nothing,
            };

            if matches!(apply, Apply::Enable { .. }) {
                port.fwd_cnt = 0;
                port.blk_cnt = 0;
            }
            port.conf = conf;
            Ok((old, apply))
        })?;

        let result = match apply {
            Apply::Nothing => Ok(()),
            Apply::Enable { reopen } => self.engine.set_enabled_with(
                PolicyId::Admin,
                iface,
                PortConf {
                    enabled: conf.enabled,
                    mode: conf.violation_mode.port_mode(),
                    reopen,
                    violate_limit: conf.violate_limit,
                    sticky: conf.enabled && conf.sticky,
                },
            ),
            Apply::Sticky => self.engine.port_sticky_set(iface, conf.sticky),
        };

        match result {
            Ok(()) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::ConfigurationChange,
                    "psec_limit",
                    "interface_conf_set"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(iface.to_string())
                .with_object_type("interface")
                .with_details(serde_json::json!({
                    "enabled": conf.enabled,
                    "limit": conf.limit,
                    "violation_mode": conf.violation_mode,
                    "violate_limit": conf.violate_limit,
                    "sticky": conf.sticky,
                })));
                Ok(())
            }
            Err(e) => {
                error!(interface = %iface, error = %e, "Applying limit configuration failed");
                self.policy.with_port(iface, |port| *port = old);
                Err(e)
            }
        }
    }

    /// Configures a static MAC and installs it if limit control is enabled.
    pub fn static_mac_add(&self, iface: InterfaceId, vid_mac: VidMac) -> Result<()> {
        if !vid_mac.mac.is_unicast() {
            return Err(PsecError::MacNotUnicast);
        }
        self.engine.check_interface(iface)?;

        let (enabled, previous) = self.policy.with_port(iface, |port| {
            let previous = port.macs.get(&vid_mac).copied();
            if previous.is_none() {
                let current = if port.conf.enabled {
                    port.fwd_cnt
                } else {
                    port.macs.len() as u32
                };
                if current >= port.conf.limit {
                    return Err(PsecError::LimitReached(iface));
                }
            }
            port.macs.insert(vid_mac, MacType::Static);
            Ok((port.conf.enabled, previous))
        })?;

        if !enabled {
            return Ok(());
        }

        self.engine
            .add_special(iface, vid_mac, MacType::Static)
            .inspect_err(|e| {
                debug!(interface = %iface, mac = %vid_mac.mac, error = %e, "Static MAC add failed");
                self.policy.with_port(iface, |port| match previous {
                    Some(mac_type) => {
                        port.macs.insert(vid_mac, mac_type);
                    }
                    None => {
                        port.macs.remove(&vid_mac);
                    }
                });
            })
    }

    /// Removes a configured static or sticky MAC.
    pub fn static_mac_del(&self, iface: InterfaceId, vid_mac: VidMac) -> Result<()> {
        let enabled = self.policy.with_port(iface, |port| {
            port.macs
                .remove(&vid_mac)
                .map(|_| port.conf.enabled)
                .ok_or(PsecError::EntryNotFound)
        })?;

        if enabled {
            self.engine.del_special(iface, vid_mac)?;
        }
        Ok(())
    }
}
