//! Frame reception on the primary: local learn and age frames, and frames
//! relayed by secondaries.

use super::pipeline::AddOrigin;
use super::{Engine, EngineState};
use crate::stack::{StackEnvelope, StackMessage};
use crate::table::EntryHandle;
use crate::types::{DelReason, MacKey, MacType, NodeRole};
use psec_types::{InterfaceId, VidMac};
use tracing::{debug, warn};

impl Engine {
    /// Receive hook for a frame copied to the CPU from a local port.
    ///
    /// Returns whether the frame is consumed, i.e. comes from a MAC that is
    /// blocked or not admitted.
    pub fn frame_rx(&self, iface: InterfaceId, vid_mac: VidMac, is_learn_frame: bool) -> bool {
        if !vid_mac.mac.is_unicast() {
            return false;
        }
        self.with_state(|state| {
            if state.role == NodeRole::Secondary || state.iface(iface).enabled.is_empty() {
                return false;
            }
            state.handle_frame(iface, vid_mac, is_learn_frame, true)
        })
    }

    /// Applies a message received from another stack node.
    pub fn handle_stack_message(&self, envelope: StackEnvelope) {
        if !envelope.is_supported() {
            return;
        }
        match envelope.msg {
            StackMessage::Frame {
                port,
                vid_mac,
                is_learn_frame,
            } => {
                let iface = InterfaceId::new(envelope.from, port);
                self.with_state(|state| {
                    if state.role == NodeRole::Secondary {
                        warn!(from = %envelope.from, "Relayed frame received on a secondary");
                        return;
                    }
                    if !vid_mac.mac.is_unicast() || state.check_interface(iface).is_err() {
                        debug!(interface = %iface, "Dropping relayed frame");
                        return;
                    }
                    state.handle_frame(iface, vid_mac, is_learn_frame, false);
                });
            }
            other => {
                warn!(from = %envelope.from, msg = ?other, "Unexpected stack message on the primary");
            }
        }
    }
}

impl EngineState {
    /// Known MACs are answered from the table. Only frames that would create a
    /// new entry go through the rate limiter when `rate_limited` is set;
    /// relayed frames were already limited on the node that received them.
    pub(crate) fn handle_frame(
        &mut self,
        iface: InterfaceId,
        vid_mac: VidMac,
        is_learn_frame: bool,
        rate_limited: bool,
    ) -> bool {
        let fid = self.hal.fids.fid_for(vid_mac.vid);

        if let Some(handle) = self.table.lookup_by_fid_mac(fid, vid_mac.mac) {
            let Some(entry) = self.table.get(handle) else {
                return true;
            };
            if entry.key.iface != iface {
                if !entry.mac_type.is_dynamic() {
                    return true;
                }
                debug!(key = %entry.key, to = %iface, "Station moved");
                self.mac_del(handle, DelReason::StationMoved, None);
            } else if is_learn_frame {
                let stale = !entry.is_zombie() && self.uptime.saturating_sub(entry.created_uptime) >= self.guard_secs;
                if stale {
                    self.mac_table_full(handle);
                    return true;
                }
                return entry.blocked;
            } else {
                let blocked = entry.blocked;
                if entry.cpu_copying {
                    if let Some(entry) = self.table.get_mut(handle) {
                        entry.age_frame_seen = true;
                        entry.cpu_copying = false;
                    }
                    self.hw_write_or_zombie(handle);
                }
                return blocked;
            }
        }

        let port = self.iface(iface);
        if port.learn_frames_blocked || port.static_add_in_progress {
            return true;
        }
        let mac_type = if port.sticky { MacType::Sticky } else { MacType::Dynamic };
        if rate_limited && !self.limiter.admit(iface.port, vid_mac) {
            return true;
        }
        let key = MacKey::from_vid_mac(iface, vid_mac);
        match self.mac_add(key, fid, mac_type, AddOrigin::learned()) {
            Ok(handle) => self.table.get(handle).is_none_or(|e| e.blocked),
            Err(e) => {
                debug!(key = %key, error = %e, retryable = e.is_retryable(), "MAC not admitted");
                true
            }
        }
    }

    /// The hardware lost an entry it should still hold. Park it as a zombie
    /// so the port stops copying learn frames for a while.
    fn mac_table_full(&mut self, handle: EntryHandle) {
        let Some(entry) = self.table.get(handle) else {
            return;
        };
        let key = entry.key;
        let port = self.iface(key.iface);
        let warn_due = port
            .zombie_warned_at
            .is_none_or(|at| self.uptime.saturating_sub(at) >= u64::from(self.zombie_hold));
        if warn_due {
            warn!(key = %key, "MAC table full, learn frame received for an installed entry");
        }
        self.mac_del(handle, DelReason::HwAddFailed, None);
    }
}
