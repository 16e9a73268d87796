//! Wait-for graph, cycle detection and victim selection.
//!
//! Every waiting transaction has exactly one outgoing edge, to the
//! transaction whose lock it was queued behind. A waiter runs detection
//! when it enqueues; edges that are later retargeted to a different blocker
//! are remembered and re-checked by [`LockSys::deadlock_check_pending`],
//! which the [`DeadlockMonitor`] calls periodically.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use super::trx::{Trx, WaitAbort};
use super::LockSys;
use crate::types::TrxId;

/// Weight bit set for transactions with non-transactional side effects.
const SIDE_EFFECTS_BIT: u64 = 1 << 62;
/// Weight bit set for high priority (replication applier) transactions.
const HIGH_PRIORITY_BIT: u64 = 1 << 63;

pub(crate) struct WaitEdge {
    pub(crate) waiter: Arc<Trx>,
    pub(crate) blocker: TrxId,
}

/// The wait-for graph.
#[derive(Default)]
pub(crate) struct WaitRegistry {
    edges: FxHashMap<TrxId, WaitEdge>,
    /// Waiters whose edge changed since they were last checked.
    to_check: FxHashSet<TrxId>,
}

impl WaitRegistry {
    pub(crate) fn clear_edge(&mut self, waiter: TrxId) {
        self.edges.remove(&waiter);
        self.to_check.remove(&waiter);
    }

    pub(crate) fn blocker_of(&self, waiter: TrxId) -> Option<TrxId> {
        self.edges.get(&waiter).map(|e| e.blocker)
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (TrxId, TrxId)> + '_ {
        self.edges.iter().map(|(w, e)| (*w, e.blocker))
    }

    pub(crate) fn pending(&self) -> usize {
        self.to_check.len()
    }
}

/// Outcome of registering a wait.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum WaitVerdict {
    Wait,
    /// The registering transaction closed a cycle and was chosen to break it.
    Victim,
}

/// Finds a cycle reachable from `start` with Brent's algorithm.
///
/// `next` follows the single outgoing edge of a node. Returns a node on the
/// cycle, which is not necessarily `start`.
pub fn find_cycle<T: Copy + Eq>(start: T, mut next: impl FnMut(T) -> Option<T>) -> Option<T> {
    let mut tortoise = start;
    let mut hare = start;
    let mut power = 1usize;
    let mut steps = 1usize;
    while let Some(n) = next(hare) {
        hare = n;
        if tortoise == hare {
            return Some(hare);
        }
        if steps == power {
            power <<= 1;
            steps = 0;
            tortoise = hare;
        }
        steps += 1;
    }
    None
}

/// Rollback cost of a transaction: undo records plus locks held, with
/// flag bits that make side-effecting and high priority transactions the
/// last choice.
pub fn victim_weight(undo_no: u64, n_locks: usize, side_effects: bool, high_priority: bool) -> u64 {
    let mut weight = undo_no
        .saturating_add(n_locks as u64)
        .min(SIDE_EFFECTS_BIT - 1);
    if side_effects {
        weight |= SIDE_EFFECTS_BIT;
    }
    if high_priority {
        weight |= HIGH_PRIORITY_BIT;
    }
    weight
}

/// Picks the cycle member with the smallest weight. On a tie the
/// transaction that ran detection loses.
pub fn choose_victim(members: &[(TrxId, u64)], initiator: TrxId) -> Option<TrxId> {
    let mut best: Option<(TrxId, u64)> = None;
    for &(id, weight) in members {
        best = match best {
            None => Some((id, weight)),
            Some((best_id, best_weight))
                if weight < best_weight
                    || (weight == best_weight && id == initiator && best_id != initiator) =>
            {
                Some((id, weight))
            }
            keep => keep,
        };
    }
    best.map(|(id, _)| id)
}

impl LockSys {
    /// Records that `trx` waits for `blocker` and runs cycle detection from
    /// `trx`.
    pub(crate) fn register_wait(&self, trx: &Arc<Trx>, blocker: TrxId) -> WaitVerdict {
        let mut reg = self.waits.lock();
        reg.edges.insert(
            trx.id(),
            WaitEdge {
                waiter: Arc::clone(trx),
                blocker,
            },
        );
        reg.to_check.remove(&trx.id());
        if !self.options.deadlock_detect {
            return WaitVerdict::Wait;
        }
        match self.resolve_deadlock(&mut reg, trx.id(), false) {
            Some(victim) if victim == trx.id() => WaitVerdict::Victim,
            _ => WaitVerdict::Wait,
        }
    }

    /// Points the edge of `waiter` at a new blocker after the queue it waits
    /// in changed.
    pub(crate) fn retarget_wait(&self, waiter: TrxId, blocker: TrxId) {
        let mut reg = self.waits.lock();
        let blocker_waits = reg.edges.contains_key(&blocker);
        let Some(edge) = reg.edges.get_mut(&waiter) else {
            return;
        };
        if edge.blocker == blocker {
            return;
        }
        edge.blocker = blocker;
        if self.options.deadlock_detect && blocker_waits {
            reg.to_check.insert(waiter);
        }
    }

    /// Breaks the cycle reachable from `start`, if any, and returns the
    /// victim. The victim's edge is removed.
    ///
    /// A victim other than `start` is flagged and woken; it cancels its own
    /// request. `start` itself is only flagged when `flag_initiator` is set,
    /// otherwise the caller handles it synchronously.
    fn resolve_deadlock(
        &self,
        reg: &mut WaitRegistry,
        start: TrxId,
        flag_initiator: bool,
    ) -> Option<TrxId> {
        let member = find_cycle(start, |t| reg.blocker_of(t))?;
        let mut cycle = vec![member];
        let mut cur = reg.blocker_of(member)?;
        while cur != member {
            cycle.push(cur);
            cur = reg.blocker_of(cur)?;
        }

        let policy = self.policy();
        let weighed: Vec<(TrxId, u64)> = cycle
            .iter()
            .filter_map(|id| reg.edges.get(id))
            .map(|e| {
                let t = &e.waiter;
                let weight = victim_weight(
                    t.undo_no(),
                    t.n_locks(),
                    t.has_side_effects(),
                    policy.is_high_priority(t),
                );
                (t.id(), weight)
            })
            .collect();
        let initiator = if cycle.contains(&start) { start } else { member };
        let victim = choose_victim(&weighed, initiator)?;
        let edge = reg.edges.remove(&victim)?;
        reg.to_check.remove(&victim);

        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        self.metrics.deadlock_detected(cycle.len());
        for (id, weight) in &weighed {
            let blocker = reg.blocker_of(*id).unwrap_or(edge.blocker).0;
            if self.options.print_all_deadlocks {
                warn!(trx = id.0, weight, blocker, "lock.deadlock.member");
            } else {
                debug!(trx = id.0, weight, blocker, "lock.deadlock.member");
            }
        }
        warn!(
            victim = victim.0,
            initiator = start.0,
            cycle_len = cycle.len(),
            "lock.deadlock.victim"
        );

        if victim != start || flag_initiator {
            {
                let mut state = edge.waiter.lock.lock();
                if state.wait_lock.is_some() {
                    state.abort = Some(WaitAbort::Deadlock);
                }
            }
            edge.waiter.cond.notify_all();
        }
        Some(victim)
    }

    /// Re-checks every waiter whose edge was retargeted since its last
    /// check. Returns the number of cycles broken.
    pub fn deadlock_check_pending(&self) -> usize {
        let mut reg = self.waits.lock();
        if reg.pending() == 0 {
            return 0;
        }
        let pending: Vec<TrxId> = reg.to_check.drain().collect();
        let mut resolved = 0;
        for id in pending {
            if reg.edges.contains_key(&id) && self.resolve_deadlock(&mut reg, id, true).is_some() {
                resolved += 1;
            }
        }
        resolved
    }

    /// Starts a background thread that runs [`LockSys::deadlock_check_pending`]
    /// every `deadlock_check_interval`.
    pub fn start_deadlock_monitor(self: &Arc<Self>) -> DeadlockMonitor {
        DeadlockMonitor::start(self)
    }
}

struct MonitorShared {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle of the background deadlock checker. Dropping it stops the thread.
pub struct DeadlockMonitor {
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockMonitor {
    /// Spawns the checker thread. It exits on [`DeadlockMonitor::stop`] or
    /// once the lock system is dropped.
    pub fn start(sys: &Arc<LockSys>) -> Self {
        let shared = Arc::new(MonitorShared {
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let interval = sys.options.deadlock_check_interval.max(Duration::from_millis(1));
        let weak = Arc::downgrade(sys);
        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || Self::worker_loop(weak, worker_shared, interval));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn worker_loop(sys: Weak<LockSys>, shared: Arc<MonitorShared>, interval: Duration) {
        loop {
            {
                let mut stop = shared.stop.lock();
                if !*stop {
                    shared.wakeup.wait_for(&mut stop, interval);
                }
                if *stop {
                    debug!("lock.deadlock_monitor.worker_exit");
                    break;
                }
            }
            let Some(sys) = sys.upgrade() else {
                debug!("lock.deadlock_monitor.worker_exit");
                break;
            };
            let resolved = sys.deadlock_check_pending();
            if resolved > 0 {
                debug!(resolved, "lock.deadlock_monitor.resolved");
            }
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeadlockMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DeadlockMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockMonitor")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
