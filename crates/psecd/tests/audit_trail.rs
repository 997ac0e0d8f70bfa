//! Audit records emitted by the engine
//!
//! These tests install a capturing tracing subscriber, so they run one at a time.

use parking_lot::Mutex;
use psec_types::{InterfaceId, MacAddress, NodeId, VidMac, VlanId};
use psecd::config::PsecConfig;
use psecd::hal::Hal;
use psecd::limit::{InterfaceConf, ViolationMode};
use psecd::{ClearFilter, Engine, HalError, LimitControl, PolicyId, PortConf, PortMode};
use serial_test::serial;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = Capture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn captured(f: impl FnOnce()) -> String {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    capture.text()
}

fn config() -> PsecConfig {
    let mut config = PsecConfig::default();
    config.rate_limit.filter_secs = 0;
    config
}

fn mac(last: u8) -> VidMac {
    VidMac::new(VlanId::DEFAULT, MacAddress::new([0x02, 0, 0, 0, 0, last]))
}

#[test]
#[serial]
fn test_port_shutdown_is_audited() {
    let config = config();
    let (hal, _hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let control = LimitControl::attach(engine.clone(), &config.limit).unwrap();
    let p1 = InterfaceId::new(NodeId::FIRST, 1);

    let log = captured(|| {
        control
            .interface_conf_set(
                p1,
                InterfaceConf {
                    enabled: true,
                    limit: 1,
                    violation_mode: ViolationMode::Shutdown,
                    violate_limit: 1,
                    sticky: false,
                },
            )
            .unwrap();
        engine.link_state_change(p1, true);
        engine.frame_rx(p1, mac(1), true);
        engine.frame_rx(p1, mac(2), true);
    });

    assert!(log.contains("interface_conf_set"), "{log}");
    assert!(log.contains("port_shut_down"), "{log}");
    assert!(log.contains("audit_json"), "{log}");
}

#[test]
#[serial]
fn test_hardware_failure_is_audited_once_per_hold_window() {
    let config = config();
    let (hal, hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let p1 = InterfaceId::new(NodeId::FIRST, 1);
    engine
        .register(PolicyId::Admin, Arc::new(psecd::LimitPolicy::new(InterfaceConf::from_config(&config.limit))))
        .unwrap();
    engine
        .set_enabled_with(PolicyId::Admin, p1, PortConf::new(true, PortMode::Normal))
        .unwrap();
    engine.link_state_change(p1, true);
    hw.mac_table.fail_adds(Some(HalError::Failed("parity error".to_string())));

    let log = captured(|| {
        engine.frame_rx(p1, mac(1), true);
        engine.frame_rx(p1, mac(2), true);
    });

    let records = log.lines().filter(|line| line.contains("mac_add_failed")).count();
    assert_eq!(records, 1, "{log}");
}

#[test]
#[serial]
fn test_stack_membership_is_audited() {
    let config = config();
    let (hal, _hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let node2 = NodeId::new(2).unwrap();

    let log = captured(|| {
        engine.switch_add(node2);
        engine.switch_del(node2);
    });

    assert!(log.contains("switch_add"), "{log}");
    assert!(log.contains("switch_del"), "{log}");
}

#[test]
#[serial]
fn test_restrict_violation_is_audited() {
    let config = config();
    let (hal, _hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let control = LimitControl::attach(engine.clone(), &config.limit).unwrap();
    let p1 = InterfaceId::new(NodeId::FIRST, 1);
    control
        .interface_conf_set(
            p1,
            InterfaceConf {
                enabled: true,
                limit: 1,
                violation_mode: ViolationMode::Restrict,
                violate_limit: 5,
                sticky: false,
            },
        )
        .unwrap();
    engine.link_state_change(p1, true);

    let log = captured(|| {
        engine.frame_rx(p1, mac(1), true);
        engine.frame_rx(p1, mac(2), true);
    });

    let records: Vec<&str> = log.lines().filter(|line| line.contains("mac_blocked")).collect();
    assert_eq!(records.len(), 1, "{log}");
    assert!(records[0].contains("VIOLATION"), "{log}");
    assert!(records[0].contains("02:00:00:00:00:02"), "{log}");
}

#[test]
#[serial]
fn test_policy_enablement_is_audited() {
    let config = config();
    let (hal, _hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let p1 = InterfaceId::new(NodeId::FIRST, 1);
    engine
        .register(PolicyId::Admin, Arc::new(psecd::LimitPolicy::new(InterfaceConf::from_config(&config.limit))))
        .unwrap();

    let log = captured(|| {
        engine
            .set_enabled_with(PolicyId::Admin, p1, PortConf::new(true, PortMode::Normal))
            .unwrap();
        engine
            .set_enabled_with(PolicyId::Admin, p1, PortConf::new(false, PortMode::Normal))
            .unwrap();
    });

    assert!(log.contains("SECURITY_POLICY"), "{log}");
    assert!(log.contains("policy_enable"), "{log}");
    assert!(log.contains("policy_disable"), "{log}");
}

#[test]
#[serial]
fn test_clear_is_audited_with_count() {
    let config = config();
    let (hal, _hw) = Hal::in_memory();
    let engine = Engine::new(&config, hal);
    let p1 = InterfaceId::new(NodeId::FIRST, 1);
    engine
        .register(PolicyId::Admin, Arc::new(psecd::LimitPolicy::new(InterfaceConf::from_config(&config.limit))))
        .unwrap();
    engine
        .set_enabled_with(PolicyId::Admin, p1, PortConf::new(true, PortMode::Normal))
        .unwrap();
    engine.link_state_change(p1, true);
    engine.frame_rx(p1, mac(1), true);
    engine.frame_rx(p1, mac(2), true);

    let log = captured(|| {
        let cleared = engine
            .clear(ClearFilter {
                iface: Some(p1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cleared, 2);
    });

    let record = log.lines().find(|line| line.contains("ADMIN_ACTION")).unwrap_or_default();
    assert!(record.contains("\"cleared\":2"), "{log}");
}
