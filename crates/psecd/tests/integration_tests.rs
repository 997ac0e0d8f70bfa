//! Integration tests for the admission engine
//!
//! Drives the engine end to end against the in-memory hardware layer:
//! - frame admission, arbitration and hardware programming
//! - deferred policy notifications
//! - aging, hold time and zombie entries
//! - limit control, stacking and spanning tree interaction

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use psec_types::{InterfaceId, MacAddress, NodeId, VidMac, VlanId};
use psecd::config::PsecConfig;
use psecd::hal::memory::Handles;
use psecd::hal::{DenyAction, Hal, PortMask};
use psecd::limit::{InterfaceConf, ViolationMode};
use psecd::stack::{StackEnvelope, StackMessage};
use psecd::types::MacKey;
use psecd::{
    dispatcher, scheduler, AddMethod, AddNotice, AddVerdict, ClearFilter, DelNotice, DelReason, Engine,
    HalError, LimitControl, MacType, PolicyId, PortMode, PsecError, SecurityPolicy,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POOL: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Add(VidMac),
    Del(VidMac, DelReason, AddMethod),
}

/// Policy that answers every new MAC the same way and remembers what it was told.
struct Recorder {
    method: AddMethod,
    seen: Mutex<Vec<Seen>>,
    link_ups: Mutex<Vec<InterfaceId>>,
}

impl Recorder {
    fn new(method: AddMethod) -> Arc<Self> {
        Arc::new(Self {
            method,
            seen: Mutex::new(Vec::new()),
            link_ups: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn link_ups(&self) -> Vec<InterfaceId> {
        self.link_ups.lock().clone()
    }
}

impl SecurityPolicy for Recorder {
    fn on_mac_add(&self, notice: &AddNotice) -> AddVerdict {
        self.seen.lock().push(Seen::Add(notice.vid_mac));
        AddVerdict::new(self.method)
    }

    fn on_mac_del(&self, notice: &DelNotice) {
        self.seen
            .lock()
            .push(Seen::Del(notice.vid_mac, notice.reason, notice.method));
    }

    fn on_link_up(&self, iface: InterfaceId) {
        self.link_ups.lock().push(iface);
    }
}

/// Policy that, the first time it is asked about `target`, clears it and has
/// it learned again before it answers.
struct Relearner {
    engine: Mutex<Option<Engine>>,
    iface: InterfaceId,
    target: VidMac,
    asked: Mutex<Vec<VidMac>>,
}

impl SecurityPolicy for Relearner {
    fn on_mac_add(&self, notice: &AddNotice) -> AddVerdict {
        let first = {
            let mut asked = self.asked.lock();
            asked.push(notice.vid_mac);
            asked.len() == 1
        };
        let engine = self.engine.lock().clone();
        if let (true, Some(engine)) = (first && notice.vid_mac == self.target, engine) {
            let filter = ClearFilter {
                mac: Some(self.target.mac),
                ..Default::default()
            };
            assert_eq!(engine.clear(filter).unwrap(), 1);
            engine.frame_rx(self.iface, self.target, true);
        }
        AddVerdict::new(AddMethod::Forward)
    }

    fn on_mac_del(&self, _notice: &DelNotice) {}
}

struct Harness {
    engine: Engine,
    hw: Handles,
    config: PsecConfig,
}

fn test_config(pool: usize) -> PsecConfig {
    let mut config = PsecConfig::default();
    config.engine.pool_capacity = pool;
    config.engine.zombie_hold_secs = 10;
    config.rate_limit.burst = 1000;
    config.rate_limit.filter_secs = 0;
    config
}

fn harness_with(config: PsecConfig) -> Harness {
    let (hal, hw) = Hal::in_memory();
    Harness {
        engine: Engine::new(&config, hal),
        hw,
        config,
    }
}

fn harness() -> Harness {
    harness_with(test_config(POOL))
}

fn port(port: u16) -> InterfaceId {
    InterfaceId::new(NodeId::FIRST, port)
}

fn vlan(id: u16) -> VlanId {
    VlanId::new(id).unwrap()
}

fn mac_on(vid: u16, last: u8) -> VidMac {
    VidMac::new(vlan(vid), MacAddress::new([0x02, 0x00, 0x5e, 0x10, 0x00, last]))
}

fn mac(last: u8) -> VidMac {
    mac_on(1, last)
}

impl Harness {
    /// Registers `policy` under `id`, enables it on `iface` and brings the link up.
    fn attach(&self, id: PolicyId, policy: Arc<Recorder>, iface: InterfaceId, mode: PortMode) {
        self.engine.register(id, policy).unwrap();
        self.engine.set_enabled(id, iface, true, mode).unwrap();
        self.engine.link_state_change(iface, true);
    }

    fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.engine.tick();
        }
    }

    fn present(&self, iface: InterfaceId, vid_mac: VidMac) -> bool {
        self.engine.mac_status(iface, vid_mac).is_ok()
    }

    fn pool_free(&self) -> usize {
        self.engine.global_status().pool_free
    }
}

#[test]
fn test_pool_depletion_refuses_new_macs_until_an_entry_frees() {
    let h = harness_with(test_config(2));
    let p1 = port(1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);
    assert!(h.hw.mac_table.learning(p1).cpu_copy);

    h.engine.frame_rx(p1, mac(1), true);
    h.engine.frame_rx(p1, mac(2), true);
    assert_eq!(h.pool_free(), 0);
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);

    assert!(h.engine.frame_rx(p1, mac(3), true));
    assert!(matches!(h.engine.mac_status(p1, mac(3)), Err(PsecError::EntryNotFound)));

    let cleared = h
        .engine
        .clear(ClearFilter {
            mac: Some(mac(1).mac),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(h.pool_free(), 1);
    assert!(h.hw.mac_table.learning(p1).cpu_copy);

    h.engine.frame_rx(p1, mac(3), true);
    assert!(h.present(p1, mac(3)));
}

#[test]
fn test_most_restrictive_decision_is_programmed() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    let voice = Recorder::new(AddMethod::Block);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.register(PolicyId::VoiceVlan, voice.clone()).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.set_enabled(PolicyId::VoiceVlan, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    // Held back until every policy has answered.
    assert!(h.engine.frame_rx(p1, a, true));
    let status = h.engine.mac_status(p1, a).unwrap();
    assert!(status.kept_blocked);
    assert_eq!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().destination, None);

    assert_eq!(h.engine.dispatch_pending(), 2);
    assert_eq!(h.engine.dispatch_pending(), 0);

    let status = h.engine.mac_status(p1, a).unwrap();
    assert!(status.blocked);
    assert!(!status.kept_blocked);
    assert!(status.forward.contains(PolicyId::Dot1x));
    assert!(status.block.contains(PolicyId::VoiceVlan));

    let hw = h.hw.mac_table.entry(a.vid, a.mac).unwrap();
    assert_eq!(hw.destination, None);
    assert!(hw.locked);
    assert!(!h.hw.ip_filter.allows(a.mac, a.vid));
    let deny = h.hw.ip_filter.deny_rule_for(a.mac).unwrap();
    assert_eq!(deny.ports, PortMask::All);
    assert_eq!(deny.action, DenyAction::Drop);

    // Re-stating the same decision is a no-op.
    let adds = h.hw.mac_table.add_calls();
    h.engine
        .change_decision(PolicyId::VoiceVlan, p1, a, AddMethod::Block)
        .unwrap();
    assert_eq!(h.hw.mac_table.add_calls(), adds);

    h.engine
        .change_decision(PolicyId::VoiceVlan, p1, a, AddMethod::Forward)
        .unwrap();
    assert_eq!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().destination, Some(p1));
    assert!(h.hw.ip_filter.allows(a.mac, a.vid));
    assert_eq!(h.hw.ip_filter.deny_rule_for(a.mac).unwrap().ports, PortMask::AllExcept(p1));
    assert!(!h.engine.frame_rx(p1, a, false));
}

#[test]
fn test_blocked_entry_released_when_hold_time_expires() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Block);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.set_timers(PolicyId::Dot1x, 0, 10).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();
    let status = h.engine.mac_status(p1, a).unwrap();
    assert!(status.blocked);
    assert_eq!(status.age_or_hold_left, 10);

    h.ticks(9);
    assert!(h.present(p1, a));

    let stats = h.engine.tick();
    assert_eq!(stats.hold_expired, 1);
    assert!(!h.present(p1, a));
    assert_eq!(h.pool_free(), POOL);
    assert!(h.hw.mac_table.is_empty());

    h.engine.dispatch_pending();
    assert_eq!(
        dot1x.seen(),
        vec![Seen::Add(a), Seen::Del(a, DelReason::HoldTimeExpired, AddMethod::Block)]
    );
}

#[test]
fn test_add_and_delete_before_dispatch_reach_no_policy() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.attach(PolicyId::Dot1x, dot1x.clone(), p1, PortMode::Normal);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    assert_eq!(h.engine.pending_notifications(), 1);

    assert_eq!(h.engine.clear(ClearFilter::default()).unwrap(), 1);
    assert_eq!(h.engine.pending_notifications(), 0);
    assert_eq!(h.engine.dispatch_pending(), 0);
    assert_eq!(dot1x.seen(), Vec::new());

    assert_eq!(h.pool_free(), POOL);
    assert!(h.hw.mac_table.is_empty());
    assert!(h.hw.ip_filter.deny_rule_for(a.mac).is_none());
    assert!(!h.hw.ip_filter.allows(a.mac, a.vid));
}

#[test]
fn test_decision_for_a_replaced_entry_is_dropped() {
    let h = harness();
    let p1 = port(1);
    let a = mac(1);
    let policy = Arc::new(Relearner {
        engine: Mutex::new(Some(h.engine.clone())),
        iface: p1,
        target: a,
        asked: Mutex::new(Vec::new()),
    });
    h.engine.register(PolicyId::Dot1x, policy.clone()).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    assert!(h.engine.frame_rx(p1, a, true));
    assert_eq!(h.engine.dispatch_pending(), 1);

    // The Forward answer was about the entry that got cleared.
    let status = h.engine.mac_status(p1, a).unwrap();
    assert!(status.kept_blocked);
    assert!(!status.forward.contains(PolicyId::Dot1x));
    assert_eq!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().destination, None);
    assert_eq!(h.engine.pending_notifications(), 1);

    h.engine.dispatch_pending();
    let status = h.engine.mac_status(p1, a).unwrap();
    assert!(!status.kept_blocked);
    assert!(!status.blocked);
    assert!(status.forward.contains(PolicyId::Dot1x));
    assert_eq!(*policy.asked.lock(), vec![a, a]);
    assert_eq!(h.pool_free(), POOL - 1);
}

#[test]
fn test_age_frames_keep_a_forwarding_entry_alive() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.set_timers(PolicyId::Dot1x, 10, 10).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();
    assert!(!h.engine.mac_status(p1, a).unwrap().blocked);

    for _ in 0..3 {
        h.ticks(10);
        assert!(h.present(p1, a));
        assert!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().copy_to_cpu);

        assert!(!h.engine.frame_rx(p1, a, false));
        assert!(!h.hw.mac_table.entry(a.vid, a.mac).unwrap().copy_to_cpu);
    }

    // The last age frame carries the entry through one more period.
    h.ticks(10);
    assert!(h.present(p1, a));

    h.ticks(9);
    assert!(h.present(p1, a));
    assert_eq!(h.engine.tick().aged_out, 1);
    assert!(!h.present(p1, a));

    h.engine.dispatch_pending();
    assert_eq!(
        dot1x.seen().last(),
        Some(&Seen::Del(a, DelReason::AgedOut, AddMethod::Forward))
    );
}

#[test]
fn test_rate_limit_only_holds_back_unknown_macs() {
    // Default duplicate filter and token bucket.
    let mut config = PsecConfig::default();
    config.engine.pool_capacity = 128;
    let h = harness_with(config);
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.set_timers(PolicyId::Dot1x, 10, 10).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    assert!(h.engine.frame_rx(p1, a, true));
    h.engine.dispatch_pending();

    // Repeats inside the filter window still report the entry's own state.
    assert!(!h.engine.frame_rx(p1, a, true));
    assert!(!h.engine.frame_rx(p1, a, true));

    // Drain the bucket with a burst of new MACs.
    for last in 10..110 {
        assert!(h.engine.frame_rx(p1, mac(last), true));
    }
    let refused: Vec<u8> = (10..110).filter(|last| !h.present(p1, mac(*last))).collect();
    assert!(!refused.is_empty());
    assert!(h.engine.frame_rx(p1, mac(refused[0]), true));
    h.engine.dispatch_pending();

    // An age frame for the forwarding MAC still renews it.
    h.ticks(10);
    assert!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().copy_to_cpu);
    assert!(!h.engine.frame_rx(p1, a, false));
    assert!(!h.hw.mac_table.entry(a.vid, a.mac).unwrap().copy_to_cpu);

    h.ticks(10);
    assert!(h.present(p1, a));
    assert!(!h.engine.mac_status(p1, a).unwrap().blocked);
}

// Link-up is announced to registered policies that are NOT enabled on the
// port, and link-down is announced to nobody. This asymmetry is long-standing
// behavior that policies rely on, so it is kept as is.
#[test]
fn test_link_up_notifies_only_policies_not_enabled_on_the_port() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    let voice = Recorder::new(AddMethod::Forward);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.register(PolicyId::VoiceVlan, voice.clone()).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();

    h.engine.link_state_change(p1, true);
    assert_eq!(dot1x.link_ups(), Vec::new());
    assert_eq!(voice.link_ups(), vec![p1]);

    h.engine.link_state_change(p1, false);
    assert_eq!(dot1x.link_ups(), Vec::new());
    assert_eq!(voice.link_ups(), vec![p1]);
}

#[test]
fn test_link_down_flushes_learned_entries() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.attach(PolicyId::Dot1x, dot1x.clone(), p1, PortMode::Normal);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();

    h.engine.link_state_change(p1, false);
    assert!(!h.present(p1, a));
    assert!(!h.hw.mac_table.learning(p1).enabled);

    // Frames on a down link are not admitted.
    assert!(h.engine.frame_rx(p1, mac(2), true));
    assert!(!h.present(p1, mac(2)));

    h.engine.dispatch_pending();
    assert_eq!(
        dot1x.seen(),
        vec![Seen::Add(a), Seen::Del(a, DelReason::PortLinkDown, AddMethod::Forward)]
    );
}

#[test]
fn test_station_move_relearns_on_the_new_port() {
    let h = harness();
    let (p1, p2) = (port(1), port(2));
    let dot1x = Recorder::new(AddMethod::Forward);
    h.attach(PolicyId::Dot1x, dot1x.clone(), p1, PortMode::Normal);
    h.engine.set_enabled(PolicyId::Dot1x, p2, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p2, true);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();

    h.engine.frame_rx(p2, a, true);
    h.engine.dispatch_pending();

    assert!(!h.present(p1, a));
    assert!(h.present(p2, a));
    assert_eq!(h.hw.mac_table.entry(a.vid, a.mac).unwrap().destination, Some(p2));
    assert_eq!(
        dot1x.seen(),
        vec![
            Seen::Add(a),
            Seen::Del(a, DelReason::StationMoved, AddMethod::Forward),
            Seen::Add(a),
        ]
    );
}

#[test]
fn test_keep_blocked_mode_only_admits_explicit_adds() {
    let h = harness();
    let (p1, p2) = (port(1), port(2));
    let dot1x = Recorder::new(AddMethod::Forward);
    h.attach(PolicyId::Dot1x, dot1x.clone(), p1, PortMode::KeepBlocked);

    let a = mac(1);
    assert!(h.engine.frame_rx(p1, a, true));
    assert!(!h.present(p1, a));

    h.engine
        .explicit_add(PolicyId::Dot1x, p1, a, AddMethod::Forward)
        .unwrap();
    assert!(!h.engine.mac_status(p1, a).unwrap().blocked);
    assert!(matches!(
        h.engine.explicit_add(PolicyId::Dot1x, p1, a, AddMethod::Forward),
        Err(PsecError::AlreadyPresent(iface)) if iface == p1
    ));

    h.engine.set_enabled(PolicyId::Dot1x, p2, true, PortMode::Normal).unwrap();
    assert!(matches!(
        h.engine.explicit_add(PolicyId::Dot1x, p2, mac(2), AddMethod::Forward),
        Err(PsecError::InvalidPolicyMode(PolicyId::Dot1x))
    ));
    assert!(matches!(
        h.engine.explicit_add(PolicyId::Admin, p1, mac(2), AddMethod::Forward),
        Err(PsecError::InvalidPolicy(PolicyId::Admin))
    ));

    h.engine.explicit_del(PolicyId::Dot1x, p1, a).unwrap();
    assert!(!h.present(p1, a));

    // The originating policy is never called back about its own requests.
    h.engine.dispatch_pending();
    assert_eq!(dot1x.seen(), Vec::new());
}

#[test]
fn test_protect_mode_stops_learning_at_the_limit() {
    let h = harness();
    let p1 = port(1);
    let control = LimitControl::attach(h.engine.clone(), &h.config.limit).unwrap();
    control
        .interface_conf_set(
            p1,
            InterfaceConf {
                enabled: true,
                limit: 2,
                violation_mode: ViolationMode::Protect,
                violate_limit: 1,
                sticky: false,
            },
        )
        .unwrap();
    h.engine.link_state_change(p1, true);

    assert!(!h.engine.frame_rx(p1, mac(1), true));
    assert!(!h.engine.frame_rx(p1, mac(2), true));
    let status = h.engine.interface_status(p1).unwrap();
    assert!(status.limit_reached);
    assert!(!status.cpu_copy);
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);

    assert!(h.engine.frame_rx(p1, mac(3), true));
    assert!(!h.present(p1, mac(3)));
    assert_eq!(control.ref_counts(p1), (2, 0));

    h.engine
        .clear(ClearFilter {
            mac: Some(mac(1).mac),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(control.ref_counts(p1), (1, 0));
    assert!(!h.engine.interface_status(p1).unwrap().limit_reached);
    assert!(h.hw.mac_table.learning(p1).cpu_copy);
}

#[test]
fn test_restrict_mode_counts_violators_up_to_the_violation_limit() {
    let h = harness();
    let p1 = port(1);
    let control = LimitControl::attach(h.engine.clone(), &h.config.limit).unwrap();
    control
        .interface_conf_set(
            p1,
            InterfaceConf {
                enabled: true,
                limit: 1,
                violation_mode: ViolationMode::Restrict,
                violate_limit: 2,
                sticky: false,
            },
        )
        .unwrap();
    h.engine.link_state_change(p1, true);

    let (a, b, c, d) = (mac(1), mac(2), mac(3), mac(4));
    assert!(!h.engine.frame_rx(p1, a, true));
    assert!(h.hw.mac_table.learning(p1).cpu_copy);

    assert!(h.engine.frame_rx(p1, b, true));
    assert!(h.engine.frame_rx(p1, c, true));
    let violator = h.engine.mac_status(p1, b).unwrap();
    assert!(violator.violating);
    assert!(violator.blocked);
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);

    assert!(h.engine.frame_rx(p1, d, true));
    assert!(!h.present(p1, d));

    let status = h.engine.interface_status(p1).unwrap();
    assert_eq!((status.cur_violate, status.total_violate), (2, 2));
    let notification = h.engine.interface_notification_status(p1).unwrap();
    assert_eq!(notification.latest_violator, Some(c));
    assert!(!notification.shut_down);

    h.engine
        .clear(ClearFilter {
            mac: Some(b.mac),
            ..Default::default()
        })
        .unwrap();
    let status = h.engine.interface_status(p1).unwrap();
    assert_eq!((status.cur_violate, status.total_violate), (1, 2));
    assert!(h.hw.mac_table.learning(p1).cpu_copy);
    assert_eq!(control.ref_counts(p1), (1, 1));
}

#[test]
fn test_shutdown_mode_closes_the_port_until_link_flaps() {
    let h = harness();
    let p1 = port(1);
    let control = LimitControl::attach(h.engine.clone(), &h.config.limit).unwrap();
    control
        .interface_conf_set(
            p1,
            InterfaceConf {
                enabled: true,
                limit: 2,
                violation_mode: ViolationMode::Shutdown,
                violate_limit: 1,
                sticky: false,
            },
        )
        .unwrap();
    h.engine.link_state_change(p1, true);

    let (a, b, c, d) = (mac(1), mac(2), mac(3), mac(4));
    assert!(!h.engine.frame_rx(p1, a, true));
    assert!(!h.engine.frame_rx(p1, b, true));
    assert!(h.engine.frame_rx(p1, c, true));

    assert_eq!(h.engine.mac_status_all(Some(p1)), Vec::new());
    assert!(h.hw.mac_table.is_empty());
    assert_eq!(h.pool_free(), POOL);
    assert_eq!(control.ref_counts(p1), (0, 0));
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);

    let notification = h.engine.interface_notification_status(p1).unwrap();
    assert!(notification.shut_down);
    assert_eq!(notification.latest_violator, Some(c));

    assert!(h.engine.frame_rx(p1, d, true));
    assert!(!h.present(p1, d));

    h.engine.link_state_change(p1, false);
    h.engine.link_state_change(p1, true);
    assert!(!h.engine.interface_status(p1).unwrap().shut_down);
    assert!(!h.engine.frame_rx(p1, d, true));
    assert!(h.present(p1, d));
}

#[test]
fn test_static_macs_survive_link_down_and_clear() {
    let h = harness();
    let p1 = port(1);
    let control = LimitControl::attach(h.engine.clone(), &h.config.limit).unwrap();
    control
        .interface_conf_set(
            p1,
            InterfaceConf {
                enabled: true,
                ..InterfaceConf::from_config(&h.config.limit)
            },
        )
        .unwrap();

    let s = mac(9);
    // Static entries go in even while the link is down.
    control.static_mac_add(p1, s).unwrap();
    let status = h.engine.mac_status(p1, s).unwrap();
    assert_eq!(status.mac_type, MacType::Static);
    assert_eq!(status.age_or_hold_left, 0);
    assert!(!status.blocked);

    h.engine.link_state_change(p1, true);
    h.engine.link_state_change(p1, false);
    assert!(h.present(p1, s));

    assert_eq!(h.engine.clear(ClearFilter::default()).unwrap(), 0);
    assert!(h.present(p1, s));

    // Another port cannot claim the address.
    assert!(matches!(
        h.engine.add_special(port(2), s, MacType::Static),
        Err(PsecError::AlreadyPresent(iface)) if iface == p1
    ));

    control.static_mac_del(p1, s).unwrap();
    assert!(!h.present(p1, s));
    assert_eq!(control.macs(p1), Vec::new());
}

#[test]
fn test_sticky_port_converts_forwarding_entries() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();
    h.engine.set_timers(PolicyId::Dot1x, 60, 60).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();
    assert_eq!(h.engine.mac_status(p1, a).unwrap().age_or_hold_left, 60);

    h.engine.port_sticky_set(p1, true).unwrap();
    let status = h.engine.mac_status(p1, a).unwrap();
    assert_eq!(status.mac_type, MacType::Sticky);
    assert_eq!(status.age_or_hold_left, 0);

    let b = mac(2);
    h.engine.frame_rx(p1, b, true);
    assert_eq!(h.engine.mac_status(p1, b).unwrap().mac_type, MacType::Sticky);
    assert_eq!(h.engine.clear(ClearFilter::default()).unwrap(), 0);
}

#[test]
fn test_hardware_failure_parks_a_hidden_zombie() {
    let h = harness();
    let p1 = port(1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);

    let a = mac(1);
    h.hw.mac_table.fail_adds(Some(HalError::TableFull));
    assert!(h.engine.frame_rx(p1, a, true));
    h.hw.mac_table.fail_adds(None);

    assert!(matches!(h.engine.mac_status(p1, a), Err(PsecError::EntryNotFound)));
    assert_eq!(h.engine.mac_status_all(None), Vec::new());
    assert_eq!(h.pool_free(), POOL - 1);
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);

    // The zombie swallows frames from its address while it is held.
    assert!(h.engine.frame_rx(p1, a, true));
    assert!(!h.present(p1, a));

    h.ticks(9);
    assert_eq!(h.pool_free(), POOL - 1);
    assert_eq!(h.engine.tick().hold_expired, 1);
    assert_eq!(h.pool_free(), POOL);
    assert!(h.hw.mac_table.learning(p1).cpu_copy);

    h.engine.frame_rx(p1, a, true);
    assert!(h.present(p1, a));
}

#[test]
fn test_learn_frame_for_an_evicted_entry_makes_a_zombie() {
    let h = harness();
    let p1 = port(1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();

    // A learn frame right after the add is just a race with hardware learning.
    h.engine.frame_rx(p1, a, true);
    assert!(h.present(p1, a));

    h.hw.mac_table.evict(a.vid, a.mac);
    h.ticks(h.config.engine.mac_table_full_guard_secs as usize);
    assert!(h.engine.frame_rx(p1, a, true));
    assert!(!h.present(p1, a));
    assert!(!h.hw.mac_table.learning(p1).cpu_copy);
}

#[test]
fn test_hardware_capacity_limit_is_independent_of_the_pool() {
    let h = harness();
    let p1 = port(1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);
    h.hw.mac_table.set_capacity(Some(1));

    h.engine.frame_rx(p1, mac(1), true);
    h.engine.frame_rx(p1, mac(2), true);
    assert!(h.present(p1, mac(1)));
    assert!(!h.present(p1, mac(2)));
    assert_eq!(h.pool_free(), POOL - 2);
}

#[test]
fn test_spanning_tree_discarding_flushes_and_refuses() {
    let h = harness();
    let p1 = port(1);
    h.hw.stp.map_vlan(vlan(10), 1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);

    let (a, b) = (mac_on(10, 1), mac_on(1, 2));
    h.engine.frame_rx(p1, a, true);
    h.engine.frame_rx(p1, b, true);

    h.engine.stp_discarding_change(p1, 1, true);
    assert!(!h.present(p1, a));
    assert!(h.present(p1, b));

    let c = mac_on(10, 3);
    assert!(h.engine.frame_rx(p1, c, true));
    assert!(!h.present(p1, c));

    h.engine.stp_discarding_change(p1, 1, false);
    h.engine.frame_rx(p1, c, true);
    assert!(h.present(p1, c));
}

#[test]
fn test_shared_vlan_change_moves_hardware_entries() {
    let h = harness();
    let p1 = port(1);
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);

    let a = mac_on(20, 1);
    let clash = mac_on(30, 2);
    let owner = mac_on(1, 2);
    h.engine.frame_rx(p1, a, true);
    h.engine.frame_rx(p1, clash, true);
    h.engine.frame_rx(p1, owner, true);

    h.hw.fids.map(vlan(20), vlan(1));
    h.engine.fid_change(vlan(20), vlan(20), vlan(1));
    assert_eq!(h.engine.mac_status(p1, a).unwrap().fid, vlan(1));
    assert!(h.hw.mac_table.entry(vlan(20), a.mac).is_none());
    assert!(h.hw.mac_table.entry(vlan(1), a.mac).is_some());

    // The same MAC already learned in the target FDB wins.
    h.hw.fids.map(vlan(30), vlan(1));
    h.engine.fid_change(vlan(30), vlan(30), vlan(1));
    assert!(!h.present(p1, clash));
    assert!(h.present(p1, owner));
}

#[test]
fn test_secondary_ports_are_configured_and_relayed() {
    let h = harness();
    let node2 = NodeId::new(2).unwrap();
    let remote = InterfaceId::new(node2, 3);

    h.engine.switch_add(node2);
    let sent: Vec<_> = h.hw.transport.take().into_iter().map(|(to, env)| (to, env.msg)).collect();
    assert_eq!(
        sent,
        vec![
            (node2, StackMessage::SwitchConf { ports: BTreeSet::new() }),
            (node2, StackMessage::RateLimitConf(h.config.rate_limit)),
        ]
    );

    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), remote, PortMode::Normal);
    let sent: Vec<_> = h.hw.transport.take().into_iter().map(|(to, env)| (to, env.msg)).collect();
    assert_eq!(
        sent,
        vec![(
            node2,
            StackMessage::PortConf {
                port: 3,
                copy_to_primary: true
            }
        )]
    );

    let a = mac(1);
    h.engine.handle_stack_message(StackEnvelope::new(
        node2,
        StackMessage::Frame {
            port: 3,
            vid_mac: a,
            is_learn_frame: true,
        },
    ));
    assert!(h.present(remote, a));

    h.engine.switch_del(node2);
    assert!(!h.present(remote, a));
    assert_eq!(h.pool_free(), POOL);

    // Nothing is learned for a node that left the stack.
    h.engine.handle_stack_message(StackEnvelope::new(
        node2,
        StackMessage::Frame {
            port: 3,
            vid_mac: mac(2),
            is_learn_frame: true,
        },
    ));
    assert!(!h.present(remote, mac(2)));
}

#[test]
fn test_management_validation() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.engine.register(PolicyId::Dot1x, dot1x.clone()).unwrap();

    assert!(matches!(
        h.engine.register(PolicyId::Dot1x, dot1x.clone()),
        Err(PsecError::CallbacksAlreadyRegistered(PolicyId::Dot1x))
    ));
    assert!(matches!(
        h.engine.set_timers(PolicyId::Dot1x, 5, 60),
        Err(PsecError::InvalidAgingPeriod(5))
    ));
    assert!(matches!(
        h.engine.set_timers(PolicyId::Dot1x, 60, 0),
        Err(PsecError::InvalidHoldTime(0))
    ));
    assert!(matches!(
        h.engine.set_enabled(PolicyId::VoiceVlan, p1, true, PortMode::Normal),
        Err(PsecError::InvalidPolicy(PolicyId::VoiceVlan))
    ));
    assert!(matches!(
        h.engine.set_enabled(PolicyId::Dot1x, port(65), true, PortMode::Normal),
        Err(PsecError::InvalidInterface(_))
    ));

    // Multicast sources are never subject to admission.
    let multicast = VidMac::new(vlan(1), MacAddress::new([0x01, 0x00, 0x5e, 0, 0, 1]));
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);
    assert!(!h.engine.frame_rx(p1, multicast, true));
    assert_eq!(h.engine.mac_status_all(None), Vec::new());

    let caps = h.engine.capabilities();
    assert!(caps.registered.contains(PolicyId::Dot1x));
    assert_eq!(caps.pool_capacity, POOL);
}

#[test]
fn test_status_iteration_walks_entries_in_key_order() {
    let h = harness();
    let (p1, p2) = (port(1), port(2));
    h.attach(PolicyId::Dot1x, Recorder::new(AddMethod::Forward), p1, PortMode::Normal);
    h.engine.set_enabled(PolicyId::Dot1x, p2, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p2, true);

    h.engine.frame_rx(p2, mac(1), true);
    h.engine.frame_rx(p1, mac(3), true);
    h.engine.frame_rx(p1, mac(2), true);

    let mut walked = Vec::new();
    let mut cursor = None;
    while let Some(status) = h.engine.mac_status_iter(cursor) {
        walked.push((status.iface, status.vid_mac));
        cursor = Some(MacKey::new(status.iface, status.vid_mac.vid, status.vid_mac.mac));
    }
    assert_eq!(walked, vec![(p1, mac(2)), (p1, mac(3)), (p2, mac(1))]);
    assert_eq!(h.engine.mac_status_all(Some(p1)).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_task_delivers_queued_notifications() {
    let h = harness();
    let p1 = port(1);
    let dot1x = Recorder::new(AddMethod::Forward);
    h.attach(PolicyId::Dot1x, dot1x.clone(), p1, PortMode::Normal);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(dispatcher::run(h.engine.clone(), Duration::from_secs(60), cancel.clone()));

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(dot1x.seen(), vec![Seen::Add(a)]);
    assert!(!h.engine.mac_status(p1, a).unwrap().blocked);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_task_counts_down_hold_time() {
    let h = harness();
    let p1 = port(1);
    h.engine.register(PolicyId::Dot1x, Recorder::new(AddMethod::Block)).unwrap();
    h.engine.set_timers(PolicyId::Dot1x, 0, 10).unwrap();
    h.engine.set_enabled(PolicyId::Dot1x, p1, true, PortMode::Normal).unwrap();
    h.engine.link_state_change(p1, true);

    let a = mac(1);
    h.engine.frame_rx(p1, a, true);
    h.engine.dispatch_pending();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler::run(h.engine.clone(), Duration::from_secs(1), cancel.clone()));

    tokio::time::sleep(Duration::from_millis(9_500)).await;
    assert!(h.present(p1, a));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h.present(p1, a));
    assert_eq!(h.engine.global_status().uptime_secs, 10);

    cancel.cancel();
    task.await.unwrap();
}
