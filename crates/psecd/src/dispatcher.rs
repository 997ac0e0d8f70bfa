//! Deferred policy notifications.
//!
//! Non-admin policies are never called with the engine lock held. The
//! admission pipeline records what each policy is owed in a
//! [`DeferredQueue`] under the lock; the dispatcher task swaps the queue out,
//! delivers deletes then adds with the lock released, and hands any changed
//! decisions back to the engine, which drops them if the entry's generation
//! moved on in the meantime.

use crate::engine::Engine;
use crate::error::{PsecError, Result};
use crate::types::{AddMethod, DelReason, MacKey, PolicyId, PolicySet};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Notifications still owed for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredOperation {
    pub add: PolicySet,
    pub del: PolicySet,
    /// Generation of the entry the pending adds refer to.
    pub generation: u64,
    pub entry_count_before: u32,
    pub add_originating: Option<PolicyId>,
    pub del_reason: Option<DelReason>,
    /// Decision each policy had given when the entry was deleted.
    pub del_methods: [AddMethod; PolicyId::COUNT],
    pub del_originating: Option<PolicyId>,
}

impl DeferredOperation {
    fn new() -> Self {
        Self {
            add: PolicySet::EMPTY,
            del: PolicySet::EMPTY,
            generation: 0,
            entry_count_before: 0,
            add_originating: None,
            del_reason: None,
            del_methods: [AddMethod::Forward; PolicyId::COUNT],
            del_originating: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty()
    }
}

/// Pending notifications keyed by entry.
///
/// Merge rules, per policy:
/// - add then del cancels the add; nothing is delivered
/// - del then add delivers both, del first
/// - del, add, del collapses to the first del
/// - add twice or del twice is a bug
#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: BTreeMap<MacKey, DeferredOperation>,
}

impl DeferredQueue {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, key: &MacKey) -> Option<&DeferredOperation> {
        self.pending.get(key)
    }

    pub fn enqueue_add(
        &mut self,
        key: MacKey,
        policies: PolicySet,
        generation: u64,
        entry_count_before: u32,
        originating: Option<PolicyId>,
    ) -> Result<()> {
        let op = self.pending.entry(key).or_insert_with(DeferredOperation::new);
        if let Some(p) = policies.iter().find(|p| op.add.contains(*p)) {
            return Err(PsecError::Internal(format!("{key}: second add queued for {p}")));
        }
        op.add = op.add.union(policies);
        op.generation = generation;
        op.entry_count_before = entry_count_before;
        op.add_originating = originating;
        Ok(())
    }

    pub fn enqueue_del(
        &mut self,
        key: MacKey,
        policies: PolicySet,
        reason: DelReason,
        methods: &[AddMethod; PolicyId::COUNT],
        originating: Option<PolicyId>,
    ) -> Result<()> {
        let op = self.pending.entry(key).or_insert_with(DeferredOperation::new);

        let mut result = Ok(());
        for p in policies.iter() {
            if op.add.remove(p) {
                // An undelivered add is simply forgotten. If a delete was
                // queued before it, that delete still stands.
                continue;
            }
            if op.del.contains(p) {
                result = Err(PsecError::Internal(format!("{key}: second delete queued for {p}")));
                continue;
            }
            op.del.insert(p);
            op.del_methods[p.index()] = methods[p.index()];
            op.del_reason = Some(reason);
            op.del_originating = originating;
        }

        if op.is_empty() {
            self.pending.remove(&key);
        }
        result
    }

    /// Empties the queue, returning everything that was pending.
    pub fn take(&mut self) -> BTreeMap<MacKey, DeferredOperation> {
        std::mem::take(&mut self.pending)
    }
}

/// Runs the dispatcher until `cancel` fires.
///
/// Wakes when the engine signals new work and also every `period`, so work
/// queued while a batch was being delivered is never stranded.
pub async fn run(engine: Engine, period: Duration, cancel: CancellationToken) {
    let wake = engine.dispatch_signal();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("Deferred callback dispatcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = ticker.tick() => {}
        }
        let delivered = engine.dispatch_pending();
        if delivered > 0 {
            debug!(delivered, "Dispatched deferred callbacks");
        }
    }
    info!("Deferred callback dispatcher stopped");
}
