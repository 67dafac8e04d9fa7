//! Deadlock detection over the quiesced wait-for graph
//!
//! Runs inside a VM operation so no lock state changes mid-walk. Each
//! thread has at most one outgoing wait-for edge, chosen by lock-kind
//! priority: the object monitor it is blocked on, else the internal (raw)
//! runtime lock, else its park-blocker.

use crate::sync::MonitorRegistry;
use crate::threads::{ThreadId, VmThread};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A set of threads caught in a lock-wait cycle, in visitation order
#[derive(Debug, Clone)]
pub struct DeadlockCycle {
    threads: Vec<Arc<VmThread>>,
}

impl DeadlockCycle {
    /// Member threads, in the order the walk discovered them
    pub fn threads(&self) -> &[Arc<VmThread>] {
        &self.threads
    }

    /// Thread IDs of the cycle members
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| t.id()).collect()
    }
}

/// The thread holding whatever `thread` is currently waiting on
fn waiting_on_owner(thread: &VmThread, monitors: &MonitorRegistry) -> Option<ThreadId> {
    if let Some(monitor) = thread.blocked_on_monitor() {
        return monitors.owner_of(monitor);
    }
    if let Some(lock) = thread.blocked_on_raw_lock() {
        return monitors.raw_lock_owner(lock);
    }
    if let Some(blocker) = thread.park_blocker() {
        return monitors.park_blocker_owner(blocker);
    }
    None
}

/// Find all lock-wait cycles among `threads`.
///
/// Each thread is assigned a monotonically increasing discovery number the
/// first time any walk reaches it. A walk detects a cycle when it reaches a
/// thread whose discovery number is at least the walk's starting number,
/// which means the thread was discovered by this same walk. Reaching a
/// thread numbered by an earlier walk ends the chain without a cycle: that
/// region of the graph was already examined. Self-loops are not reported.
pub fn find_deadlocks(
    threads: &[Arc<VmThread>],
    monitors: &MonitorRegistry,
) -> Vec<DeadlockCycle> {
    let by_id: FxHashMap<u64, &Arc<VmThread>> = threads
        .iter()
        .map(|t| (t.id().as_u64(), t))
        .collect();

    let mut discovery: FxHashMap<u64, usize> = FxHashMap::default();
    let mut next_number = 0usize;
    let mut cycles = Vec::new();

    for start in threads {
        if discovery.contains_key(&start.id().as_u64()) {
            continue;
        }
        let walk_start = next_number;
        let mut chain: Vec<Arc<VmThread>> = Vec::new();
        let mut current = start.clone();

        loop {
            match discovery.get(&current.id().as_u64()) {
                Some(&number) if number >= walk_start => {
                    // Discovered during this walk: the cycle is the chain
                    // suffix beginning at the re-reached thread.
                    if let Some(pos) = chain.iter().position(|t| t.id() == current.id()) {
                        let members = chain[pos..].to_vec();
                        if members.len() > 1 {
                            cycles.push(DeadlockCycle { threads: members });
                        }
                    }
                    break;
                }
                Some(_) => break,
                None => {
                    discovery.insert(current.id().as_u64(), next_number);
                    next_number += 1;
                    chain.push(current.clone());
                }
            }

            let Some(owner) = waiting_on_owner(&current, monitors) else {
                break;
            };
            if owner == current.id() {
                // Waiting on a lock it holds itself; a reentrancy artifact,
                // not a deadlock.
                break;
            }
            let Some(next) = by_id.get(&owner.as_u64()) else {
                break;
            };
            current = (*next).clone();
        }
    }

    if !cycles.is_empty() {
        log::warn!("detected {} deadlock cycle(s)", cycles.len());
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectId;

    fn blocked_on_monitor_held_by(
        registry: &MonitorRegistry,
        waiter: &Arc<VmThread>,
        holder: &Arc<VmThread>,
    ) {
        let monitor = registry.monitor_for(ObjectId::new());
        monitor.set_owner_for_testing(Some(holder.id()));
        waiter.set_blocked_on_monitor(Some(monitor.id()));
    }

    #[test]
    fn test_two_thread_cycle() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");
        blocked_on_monitor_held_by(&registry, &a, &b);
        blocked_on_monitor_held_by(&registry, &b, &a);

        let cycles = find_deadlocks(&[a.clone(), b.clone()], &registry);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].thread_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_acyclic_chain_reports_nothing() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");
        let c = VmThread::new("c");
        blocked_on_monitor_held_by(&registry, &a, &b);
        blocked_on_monitor_held_by(&registry, &b, &c);

        let cycles = find_deadlocks(&[a, b, c], &registry);
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_self_loop_is_ignored() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        blocked_on_monitor_held_by(&registry, &a, &a);

        let cycles = find_deadlocks(&[a], &registry);
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_mixed_lock_kind_cycle() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");

        // a blocked on a monitor held by b, b blocked on a raw lock held by a
        blocked_on_monitor_held_by(&registry, &a, &b);
        registry.set_raw_lock_owner(42, Some(a.id()));
        b.set_blocked_on_raw_lock(Some(42));

        let cycles = find_deadlocks(&[a.clone(), b.clone()], &registry);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].thread_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_monitor_edge_takes_priority_over_park() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");
        let c = VmThread::new("c");

        // a has both a monitor edge (to b) and a park edge (to c); only the
        // monitor edge is walked, so no cycle via c is possible.
        blocked_on_monitor_held_by(&registry, &a, &b);
        let blocker = ObjectId::new();
        registry.set_park_blocker_owner(blocker, Some(c.id()));
        a.set_park_blocker(Some(blocker));
        blocked_on_monitor_held_by(&registry, &c, &a);

        let cycles = find_deadlocks(&[a, b, c], &registry);
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_two_disjoint_cycles() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");
        let c = VmThread::new("c");
        let d = VmThread::new("d");
        blocked_on_monitor_held_by(&registry, &a, &b);
        blocked_on_monitor_held_by(&registry, &b, &a);
        blocked_on_monitor_held_by(&registry, &c, &d);
        blocked_on_monitor_held_by(&registry, &d, &c);

        let cycles = find_deadlocks(&[a, b, c, d], &registry);
        assert_eq!(cycles.len(), 2);
    }

    #[test]
    fn test_tail_into_cycle_reports_cycle_members_only() {
        let registry = MonitorRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");
        let c = VmThread::new("c");
        // a -> b -> c -> b : cycle is {b, c}, a is only an entry tail
        blocked_on_monitor_held_by(&registry, &a, &b);
        blocked_on_monitor_held_by(&registry, &b, &c);
        blocked_on_monitor_held_by(&registry, &c, &b);

        let cycles = find_deadlocks(&[a, b.clone(), c.clone()], &registry);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].thread_ids(), vec![b.id(), c.id()]);
    }
}
