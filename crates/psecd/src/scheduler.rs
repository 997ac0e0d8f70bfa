//! Aging and hold-time scheduler.
//!
//! One tick counts as one second of entry time, whatever the configured tick
//! interval.

use crate::engine::Engine;
use crate::types::DelReason;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub aged_out: usize,
    pub hold_expired: usize,
    pub renewed: usize,
}

impl Engine {
    /// Advances uptime by one second and counts down every entry.
    pub fn tick(&self) -> TickStats {
        self.with_state(|state| {
            state.uptime += 1;
            let mut stats = TickStats::default();

            for handle in state.table.handles() {
                let Some(entry) = state.table.get_mut(handle) else {
                    continue;
                };
                if entry.counter == 0 || entry.kept_blocked {
                    continue;
                }
                entry.counter -= 1;
                if entry.counter != 0 {
                    continue;
                }

                if entry.is_zombie() || entry.blocked {
                    state.mac_del(handle, DelReason::HoldTimeExpired, None);
                    stats.hold_expired += 1;
                } else if entry.age_frame_seen {
                    // Restart the age period and ask for one more age frame.
                    state.mac_chg_or_zombie(handle, true);
                    let Some(entry) = state.table.get_mut(handle) else {
                        continue;
                    };
                    entry.age_frame_seen = false;
                    // Aging can be off under the current timers; no age frame is wanted then.
                    if entry.counter != 0 {
                        entry.cpu_copying = true;
                        state.hw_write_or_zombie(handle);
                    }
                    stats.renewed += 1;
                } else {
                    state.mac_del(handle, DelReason::AgedOut, None);
                    stats.aged_out += 1;
                }
            }
            stats
        })
    }
}

/// Runs the scheduler until `cancel` fires.
pub async fn run(engine: Engine, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately.
    ticker.tick().await;

    info!(period_ms = period.as_millis() as u64, "Aging scheduler started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = engine.tick();
                if stats != TickStats::default() {
                    debug!(?stats, "Aging tick");
                }
            }
        }
    }
    info!("Aging scheduler stopped");
}
