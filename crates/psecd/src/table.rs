//! MAC security table: a fixed-capacity slot arena plus an ordered key index.
//!
//! Slots are handed out from a pool shared by the whole stack. Every
//! allocation stamps the slot with a fresh generation, so an [`EntryHandle`]
//! captured before the engine lock was released can be checked for staleness
//! after it is re-taken.

use crate::error::{PsecError, Result};
use crate::hal::RuleId;
use crate::types::{AddMethod, MacKey, MacType, PolicyId};
use chrono::{DateTime, Utc};
use psec_types::{InterfaceId, MacAddress, VlanId};
use std::collections::BTreeMap;

/// Generation-checked reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: u32,
    generation: u64,
}

impl EntryHandle {
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// IP admission filter rules installed on behalf of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpFilterRules {
    pub allow: Option<RuleId>,
    pub deny: Option<RuleId>,
}

#[derive(Debug, Clone)]
pub struct MacEntry {
    pub key: MacKey,
    /// FDB the entry is installed in; differs from `key.vid` under shared-VLAN learning.
    pub fid: VlanId,
    pub mac_type: MacType,
    pub decisions: [AddMethod; PolicyId::COUNT],
    pub blocked: bool,
    pub kept_blocked: bool,
    pub violating: bool,
    pub cpu_copying: bool,
    pub age_frame_seen: bool,
    /// Age or hold countdown in seconds; 0 means not counting.
    pub counter: u32,
    pub in_hw: bool,
    pub hw_add_failed: bool,
    pub sw_add_failed: bool,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    /// Engine uptime at creation, in ticks.
    pub created_uptime: u64,
    pub ip_rules: IpFilterRules,
    generation: u64,
}

impl MacEntry {
    fn new(key: MacKey, fid: VlanId, uptime: u64, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            key,
            fid,
            mac_type: MacType::Dynamic,
            decisions: [AddMethod::Forward; PolicyId::COUNT],
            blocked: false,
            kept_blocked: false,
            violating: false,
            cpu_copying: false,
            age_frame_seen: false,
            counter: 0,
            in_hw: false,
            hw_add_failed: false,
            sw_add_failed: false,
            created_at: now,
            changed_at: now,
            created_uptime: uptime,
            ip_rules: IpFilterRules::default(),
            generation,
        }
    }

    pub const fn is_zombie(&self) -> bool {
        self.hw_add_failed || self.sw_add_failed
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn decision(&self, policy: PolicyId) -> AddMethod {
        self.decisions[policy.index()]
    }

    pub fn set_decision(&mut self, policy: PolicyId, method: AddMethod) {
        self.decisions[policy.index()] = method;
    }

    /// The disposition currently programmed, as opposed to the one the
    /// policies would arbitrate to now.
    pub fn current_method(&self) -> AddMethod {
        if self.kept_blocked {
            AddMethod::KeepBlocked
        } else if self.blocked {
            AddMethod::Block
        } else {
            AddMethod::Forward
        }
    }
}

struct Slot {
    generation: u64,
    entry: Option<MacEntry>,
}

/// The MAC security table and its global pool.
pub struct MacTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: BTreeMap<MacKey, EntryHandle>,
    next_generation: u64,
}

impl MacTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        // Pop from the back, so reverse to hand out low indices first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free,
            index: BTreeMap::new(),
            next_generation: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Takes a slot from the pool for `key`.
    ///
    /// The caller must have checked that `key` is not already present.
    pub fn allocate(&mut self, key: MacKey, fid: VlanId, uptime: u64) -> Result<EntryHandle> {
        if self.index.contains_key(&key) {
            return Err(PsecError::Internal(format!("{key} allocated twice")));
        }
        let index = self.free.pop().ok_or(PsecError::PoolDepleted)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = &mut self.slots[index as usize];
        slot.generation = generation;
        slot.entry = Some(MacEntry::new(key, fid, uptime, generation));

        let handle = EntryHandle { index, generation };
        self.index.insert(key, handle);
        Ok(handle)
    }

    /// Returns the slot to the pool. Stale handles are ignored.
    pub fn free(&mut self, handle: EntryHandle) -> Option<MacEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = 0;
        self.index.remove(&entry.key);
        self.free.push(handle.index);
        Some(entry)
    }

    pub fn lookup(&self, key: &MacKey) -> Option<EntryHandle> {
        self.index.get(key).copied()
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&MacEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut MacEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn entry(&self, key: &MacKey) -> Option<&MacEntry> {
        self.lookup(key).and_then(|h| self.get(h))
    }

    /// Finds the entry occupying `(fid, mac)` in hardware, on any interface.
    pub fn lookup_by_fid_mac(&self, fid: VlanId, mac: MacAddress) -> Option<EntryHandle> {
        self.index.iter().find_map(|(key, handle)| {
            if key.mac != mac {
                return None;
            }
            self.get(*handle).filter(|e| e.fid == fid).map(|_| *handle)
        })
    }

    /// Snapshot of all keys in (interface, VLAN, MAC) order.
    pub fn keys(&self) -> Vec<MacKey> {
        self.index.keys().copied().collect()
    }

    /// Snapshot of the handles on one interface, in key order.
    pub fn handles_on(&self, iface: InterfaceId) -> Vec<EntryHandle> {
        let first = MacKey::new(iface, VlanId::FIRST, MacAddress::ZERO);
        let last = MacKey::new(iface, VlanId::LAST, MacAddress::BROADCAST);
        self.index.range(first..=last).map(|(_, h)| *h).collect()
    }

    pub fn handles(&self) -> Vec<EntryHandle> {
        self.index.values().copied().collect()
    }

    /// First key strictly after `after` (or the first key at all).
    pub fn next_key(&self, after: Option<&MacKey>) -> Option<MacKey> {
        match after {
            None => self.index.keys().next().copied(),
            Some(k) => self
                .index
                .range((std::ops::Bound::Excluded(*k), std::ops::Bound::Unbounded))
                .next()
                .map(|(k, _)| *k),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacEntry> {
        self.index.values().filter_map(|h| self.get(*h))
    }
}
