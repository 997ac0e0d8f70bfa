//! Forwarding decision arbitration.
//!
//! Combines the decisions of all policies enabled on a port into one
//! effective disposition, derives the age and hold periods, and applies the
//! forward/block/keep-blocked transition table to an entry.

use crate::table::MacEntry;
use crate::types::{AddMethod, MacType, PolicyId, PolicySet, HOLD_TIME_MAX};
use serde::{Deserialize, Serialize};

/// Age and hold periods a policy has configured, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTimers {
    /// 0 disables aging for this policy.
    pub aging_period: u32,
    pub hold_time: u32,
}

impl Default for PolicyTimers {
    fn default() -> Self {
        Self {
            aging_period: 0,
            hold_time: HOLD_TIME_MAX,
        }
    }
}

/// Outcome of arbitrating one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    pub method: AddMethod,
    /// 0 when aging is disabled.
    pub aging_period: u32,
    /// 0 for sticky and static entries.
    pub hold_time: u32,
}

/// Most restrictive decision among `enabled`, with the shortest timers.
pub fn arbitrate(
    enabled: PolicySet,
    decisions: &[AddMethod; PolicyId::COUNT],
    timers: &[PolicyTimers; PolicyId::COUNT],
    mac_type: MacType,
) -> Arbitration {
    let method = enabled
        .iter()
        .map(|p| decisions[p.index()])
        .max()
        .unwrap_or(AddMethod::Forward);

    let aging_period = enabled
        .iter()
        .map(|p| timers[p.index()].aging_period)
        .filter(|&age| age != 0)
        .min()
        .unwrap_or(0);

    let hold_time = enabled
        .iter()
        .map(|p| timers[p.index()].hold_time)
        .min()
        .unwrap_or(HOLD_TIME_MAX);

    if mac_type.is_dynamic() {
        Arbitration {
            method,
            aging_period,
            hold_time,
        }
    } else {
        Arbitration {
            method,
            aging_period: 0,
            hold_time: 0,
        }
    }
}

/// What to do with the age/hold countdown on a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Keep,
    StartAge,
    StartHold,
    /// Adopt the new age period if it is shorter, or if aging was off.
    ShortenAge,
    ShortenHold,
}

/// One cell of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub rewrite_hw: bool,
    pub timer: TimerAction,
    pub cpu_copy_off: bool,
    /// Count the current period as active so a fresh forwarder is not aged
    /// out before its first probe.
    pub mark_activity: bool,
}

impl Transition {
    const NOTHING: Transition = Transition {
        rewrite_hw: false,
        timer: TimerAction::Keep,
        cpu_copy_off: false,
        mark_activity: false,
    };

    const TO_FORWARD: Transition = Transition {
        rewrite_hw: true,
        timer: TimerAction::StartAge,
        cpu_copy_off: true,
        mark_activity: true,
    };
}

/// Transition from the programmed disposition (`None` for a brand-new entry)
/// to the newly arbitrated one.
pub const fn transition(from: Option<AddMethod>, to: AddMethod) -> Transition {
    use AddMethod::*;
    match (from, to) {
        (None, Forward) => Transition::TO_FORWARD,
        (None, Block) => Transition {
            rewrite_hw: true,
            timer: TimerAction::StartHold,
            cpu_copy_off: true,
            mark_activity: false,
        },
        (None, KeepBlocked) => Transition {
            rewrite_hw: true,
            timer: TimerAction::Keep,
            cpu_copy_off: true,
            mark_activity: false,
        },

        (Some(Forward), Forward) => Transition {
            timer: TimerAction::ShortenAge,
            ..Transition::NOTHING
        },
        (Some(Forward), Block) => Transition {
            rewrite_hw: true,
            timer: TimerAction::StartHold,
            cpu_copy_off: true,
            mark_activity: false,
        },
        (Some(Forward), KeepBlocked) => Transition {
            rewrite_hw: true,
            timer: TimerAction::Keep,
            cpu_copy_off: true,
            mark_activity: false,
        },

        (Some(Block), Forward) | (Some(KeepBlocked), Forward) => Transition::TO_FORWARD,
        (Some(Block), Block) => Transition {
            timer: TimerAction::ShortenHold,
            ..Transition::NOTHING
        },
        (Some(Block), KeepBlocked) => Transition::NOTHING,

        (Some(KeepBlocked), Block) => Transition {
            timer: TimerAction::StartHold,
            ..Transition::NOTHING
        },
        (Some(KeepBlocked), KeepBlocked) => Transition::NOTHING,
    }
}

/// Applies `arb` to `entry` and reports whether the hardware entry must be
/// (re)written.
///
/// With `times_only` the programmed disposition is left alone and only the
/// running counter is adjusted to the current timers.
pub fn apply(entry: &mut MacEntry, arb: &Arbitration, times_only: bool) -> bool {
    let from = entry.in_hw.then(|| entry.current_method());
    let to = if times_only {
        from.unwrap_or(arb.method)
    } else {
        arb.method
    };
    let cell = transition(from, to);
    let mut rewrite = cell.rewrite_hw;

    if cell.cpu_copy_off {
        entry.cpu_copying = false;
    }
    if cell.mark_activity {
        entry.age_frame_seen = true;
    }

    match cell.timer {
        TimerAction::Keep => {}
        TimerAction::StartAge => entry.counter = arb.aging_period,
        TimerAction::StartHold => entry.counter = arb.hold_time,
        TimerAction::ShortenAge => {
            let age = arb.aging_period;
            if (entry.counter == 0 && age != 0) || entry.counter > age {
                entry.counter = age;
                if age == 0 && entry.cpu_copying {
                    entry.cpu_copying = false;
                    rewrite = true;
                }
            }
        }
        TimerAction::ShortenHold => entry.counter = entry.counter.min(arb.hold_time),
    }

    if !times_only {
        entry.blocked = to != AddMethod::Forward;
        entry.kept_blocked = to == AddMethod::KeepBlocked;
    }

    rewrite
}
