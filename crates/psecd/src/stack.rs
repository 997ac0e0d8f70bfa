//! Stack distribution: frame relay from secondaries and configuration push
//! from the primary.
//!
//! Only the primary node owns the MAC security table. Secondaries watch their
//! own ports, rate limit learn and age frames, and forward one
//! [`StackMessage::Frame`] per accepted frame. Sends never block: every
//! node pair has a bounded queue and a full queue drops the message, which
//! is the same as the frame never having been seen.

use crate::config::RateLimitConfig;
use crate::engine::Engine;
use crate::error::HalError;
use parking_lot::Mutex;
use psec_types::{NodeId, PortNo, VidMac};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STACK_PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackMessage {
    /// Primary to secondary.
    RateLimitConf(RateLimitConfig),
    /// Primary to secondary: start or stop relaying frames from one port.
    PortConf { port: PortNo, copy_to_primary: bool },
    /// Primary to secondary: the complete set of ports to relay.
    SwitchConf { ports: BTreeSet<PortNo> },
    /// Secondary to primary.
    Frame {
        port: PortNo,
        vid_mac: VidMac,
        /// `false` for an age probe of a known entry.
        is_learn_frame: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEnvelope {
    pub version: u8,
    pub from: NodeId,
    pub msg: StackMessage,
}

impl StackEnvelope {
    pub fn new(from: NodeId, msg: StackMessage) -> Self {
        Self {
            version: STACK_PROTOCOL_VERSION,
            from,
            msg,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Envelopes from a newer or older protocol revision are dropped.
    pub fn is_supported(&self) -> bool {
        if self.version == STACK_PROTOCOL_VERSION {
            return true;
        }
        warn!(
            from = %self.from,
            version = self.version,
            expected = STACK_PROTOCOL_VERSION,
            "Dropping stack message with unknown version"
        );
        false
    }
}

/// Point-to-point messaging between stack nodes.
pub trait StackTransport: Send + Sync {
    /// Queues `envelope` for `to` without waiting.
    fn send(&self, to: NodeId, envelope: StackEnvelope) -> Result<(), HalError>;
}

/// In-process transport: one bounded channel per destination node.
#[derive(Default)]
pub struct ChannelTransport {
    senders: Mutex<HashMap<NodeId, mpsc::Sender<StackEnvelope>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the inbound queue for `node`, replacing any earlier one.
    pub fn connect(&self, node: NodeId, depth: usize) -> mpsc::Receiver<StackEnvelope> {
        let (tx, rx) = mpsc::channel(depth);
        self.senders.lock().insert(node, tx);
        rx
    }

    pub fn disconnect(&self, node: NodeId) {
        self.senders.lock().remove(&node);
    }
}

impl StackTransport for ChannelTransport {
    fn send(&self, to: NodeId, envelope: StackEnvelope) -> Result<(), HalError> {
        let sender = self
            .senders
            .lock()
            .get(&to)
            .cloned()
            .ok_or_else(|| HalError::Failed(format!("node {to} is not connected")))?;
        sender.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HalError::Failed(format!("queue to node {to} is full")),
            mpsc::error::TrySendError::Closed(_) => HalError::Failed(format!("node {to} has gone away")),
        })
    }
}

const MILLI: u64 = 1000;

/// Token bucket plus a short-term duplicate filter for frames headed to the
/// engine.
#[derive(Debug)]
pub struct RateLimiter {
    conf: RateLimitConfig,
    /// Thousandths of a token.
    tokens: u64,
    last_refill: Instant,
    recent: HashMap<(PortNo, VidMac), Instant>,
}

impl RateLimiter {
    pub fn new(conf: RateLimitConfig) -> Self {
        Self::new_at(conf, Instant::now())
    }

    pub fn new_at(conf: RateLimitConfig, now: Instant) -> Self {
        Self {
            conf,
            tokens: conf.burst as u64 * MILLI,
            last_refill: now,
            recent: HashMap::new(),
        }
    }

    pub fn conf(&self) -> RateLimitConfig {
        self.conf
    }

    pub fn set_conf(&mut self, conf: RateLimitConfig) {
        self.conf = conf;
        self.tokens = self.tokens.min(conf.burst as u64 * MILLI);
        self.recent.clear();
    }

    pub fn admit(&mut self, port: PortNo, vid_mac: VidMac) -> bool {
        self.admit_at(port, vid_mac, Instant::now())
    }

    pub fn admit_at(&mut self, port: PortNo, vid_mac: VidMac, now: Instant) -> bool {
        let window = Duration::from_secs(self.conf.filter_secs);
        if let Some(seen) = self.recent.get(&(port, vid_mac)) {
            if now.saturating_duration_since(*seen) < window {
                return false;
            }
        }

        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            let cap = self.conf.burst as u64 * MILLI;
            self.tokens = (self.tokens + elapsed_ms * self.conf.refill_per_sec as u64).min(cap);
            self.last_refill = now;
        }
        if self.tokens < MILLI {
            return false;
        }
        self.tokens -= MILLI;

        if self.recent.len() >= 4 * self.conf.burst.max(1) as usize {
            self.recent
                .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }
        self.recent.insert((port, vid_mac), now);
        true
    }

    pub fn clear_port(&mut self, port: PortNo) {
        self.recent.retain(|(p, _), _| *p != port);
    }

    pub fn clear_all(&mut self) {
        self.recent.clear();
    }
}

/// Frame relay running on a secondary node.
pub struct SecondaryRelay {
    node: NodeId,
    primary: NodeId,
    copy_to_primary: BTreeSet<PortNo>,
    limiter: RateLimiter,
    transport: Arc<dyn StackTransport>,
}

impl SecondaryRelay {
    pub fn new(
        node: NodeId,
        primary: NodeId,
        conf: RateLimitConfig,
        transport: Arc<dyn StackTransport>,
    ) -> Self {
        Self {
            node,
            primary,
            copy_to_primary: BTreeSet::new(),
            limiter: RateLimiter::new(conf),
            transport,
        }
    }

    pub fn relayed_ports(&self) -> &BTreeSet<PortNo> {
        &self.copy_to_primary
    }

    pub fn rate_limit_conf(&self) -> RateLimitConfig {
        self.limiter.conf()
    }

    /// Applies configuration pushed by the primary.
    pub fn handle_message(&mut self, envelope: StackEnvelope) {
        if !envelope.is_supported() {
            return;
        }
        match envelope.msg {
            StackMessage::RateLimitConf(conf) => self.limiter.set_conf(conf),
            StackMessage::PortConf {
                port,
                copy_to_primary,
            } => {
                if copy_to_primary {
                    self.copy_to_primary.insert(port);
                } else {
                    self.copy_to_primary.remove(&port);
                }
                self.limiter.clear_port(port);
            }
            StackMessage::SwitchConf { ports } => {
                self.copy_to_primary = ports;
                self.limiter.clear_all();
            }
            StackMessage::Frame { .. } => {
                warn!(node = %self.node, from = %envelope.from, "Secondary received a frame relay");
            }
        }
    }

    /// Receive hook for frames on local ports. Never consumes the frame.
    pub fn frame_rx(&mut self, port: PortNo, vid_mac: VidMac, is_learn_frame: bool) -> bool {
        if !vid_mac.mac.is_unicast() || !self.copy_to_primary.contains(&port) {
            return false;
        }
        if !self.limiter.admit(port, vid_mac) {
            return false;
        }
        let envelope = StackEnvelope::new(
            self.node,
            StackMessage::Frame {
                port,
                vid_mac,
                is_learn_frame,
            },
        );
        if let Err(e) = self.transport.send(self.primary, envelope) {
            debug!(port, mac = %vid_mac.mac, error = %e, "Frame relay dropped");
        }
        false
    }
}

/// Applies configuration from the primary until `cancel` fires.
pub async fn run_secondary(
    relay: Arc<Mutex<SecondaryRelay>>,
    mut inbox: mpsc::Receiver<StackEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(envelope) => relay.lock().handle_message(envelope),
                None => break,
            },
        }
    }
    info!("Secondary stack relay stopped");
}

/// Feeds relayed frames into the engine until `cancel` fires.
pub async fn run_primary(
    engine: Engine,
    mut inbox: mpsc::Receiver<StackEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(envelope) => engine.handle_stack_message(envelope),
                None => break,
            },
        }
    }
    info!("Primary stack receiver stopped");
}
