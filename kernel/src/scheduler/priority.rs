/*
 * Priority Donation
 *
 * Implements priority inheritance for locks: when a thread blocks trying
 * to acquire a lock held by a lower-priority thread, it donates its
 * priority to the holder (and transitively, to whatever *that* holder is
 * itself waiting on), so a medium-priority thread can't starve a
 * high-priority thread behind a low-priority lock holder.
 *
 * This operates directly on `Scheduler`/`Thread` state rather than through
 * the `KernelSchedCtx` trait: donation is a mechanism-level concern shared
 * by every policy, not something policies themselves decide.
 */

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use super::thread::DONATION_MAX_DEPTH;
use super::ThreadId;

/// Maps a lock ID (`Lock::id()`) to the thread that currently holds it.
/// Consulted while walking a donation chain; locks themselves don't know
/// about each other, so this registry is what lets `donate` hop from one
/// lock to the next.
static LOCK_OWNERS: Mutex<BTreeMap<usize, ThreadId>> = Mutex::new(BTreeMap::new());

pub fn set_lock_owner(lock_id: usize, owner: ThreadId) {
    LOCK_OWNERS.lock().insert(lock_id, owner);
}

pub fn clear_lock_owner(lock_id: usize) {
    LOCK_OWNERS.lock().remove(&lock_id);
}

fn lock_owner(lock_id: usize) -> Option<ThreadId> {
    LOCK_OWNERS.lock().get(&lock_id).copied()
}

/// Donate `waiter`'s priority along the chain `waiter -> wait_on_lock ->
/// owner -> wait_on_lock -> ...`, raising each owner's effective priority
/// to at least the waiter's. Stops early once an owner already has
/// sufficient priority, since nothing further down the chain needs
/// raising. Bounded to `DONATION_MAX_DEPTH` hops to cap the cost of
/// pathological lock-chains.
///
/// Call this right after setting `waiter.wait_on_lock = Some(lock_id)`
/// and before blocking.
pub fn donate(waiter: ThreadId) {
    super::with_scheduler_mut(|scheduler| {
        let mut current = waiter;

        for _ in 0..DONATION_MAX_DEPTH {
            let found = scheduler
                .threads
                .iter()
                .find(|t| t.id == current)
                .map(|t| (t.effective_priority, t.wait_on_lock));

            let (donor_priority, next_lock) = match found {
                Some(v) => v,
                None => return,
            };

            let lock_id = match next_lock {
                Some(id) => id,
                None => return,
            };

            let owner = match lock_owner(lock_id) {
                Some(o) => o,
                None => return,
            };

            if owner == current {
                return;
            }

            let mut raised = false;
            if let Some(owner_thread) = scheduler.threads.iter_mut().find(|t| t.id == owner) {
                if !owner_thread.donors.contains(&waiter) {
                    owner_thread.donors.push(waiter);
                }
                if owner_thread.effective_priority < donor_priority {
                    owner_thread.effective_priority = donor_priority;
                    raised = true;
                }
            }

            if !raised {
                return;
            }
            current = owner;
        }
    });
}

/// Recompute `tid`'s effective priority from its base priority and its
/// remaining donors' effective priorities. Call after a lock release
/// drops a donor, or after any donor's own priority changes.
pub fn recompute(tid: ThreadId) {
    super::with_scheduler_mut(|scheduler| {
        let donors: Vec<ThreadId> = match scheduler.threads.iter().find(|t| t.id == tid) {
            Some(t) => t.donors.clone(),
            None => return,
        };

        // A donor only still counts if it's actively waiting on a lock
        // this thread currently owns; once it acquires (or gives up), its
        // donation lapses even though we haven't pruned `donors` yet.
        let mut still_donating = Vec::new();
        let mut donor_max: u8 = 0;
        for d in &donors {
            let Some(dt) = scheduler.threads.iter().find(|t| t.id == *d) else {
                continue;
            };
            let active = dt
                .wait_on_lock
                .map(|lid| lock_owner(lid) == Some(tid))
                .unwrap_or(false);
            if active {
                still_donating.push(*d);
                donor_max = donor_max.max(dt.effective_priority);
            }
        }

        if let Some(t) = scheduler.threads.iter_mut().find(|t| t.id == tid) {
            t.donors = still_donating;
            t.effective_priority = t.base_priority.max(donor_max);
        }
    });
}

/// Drop a specific donor from `owner`'s donor set and recompute `owner`'s
/// effective priority. Used when a donor's wait ends without going through
/// the normal lock-release path (e.g. a future timed-wait extension).
pub fn remove_donor(owner: ThreadId, donor: ThreadId) {
    super::with_scheduler_mut(|scheduler| {
        if let Some(t) = scheduler.threads.iter_mut().find(|t| t.id == owner) {
            t.donors.retain(|&d| d != donor);
        }
    });
    recompute(owner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn push_thread(id: usize, priority: u8) {
        super::super::with_scheduler_mut(|scheduler| {
            let thread = super::super::Thread::new(
                ThreadId(id),
                id.to_string(),
                vec![0u8; 16].into_boxed_slice(),
                super::super::InterruptContext::default(),
                super::super::ProcessId(0),
            )
            .with_priority(priority);
            scheduler.threads.push(thread);
        });
    }

    fn effective_priority(id: usize) -> u8 {
        super::super::with_scheduler(|scheduler| {
            scheduler
                .threads
                .iter()
                .find(|t| t.id == ThreadId(id))
                .map(|t| t.effective_priority)
                .unwrap()
        })
    }

    /// A (low) holds L1, B (medium) holds L2 and waits on L1, C (high) waits
    /// on L2 — a 3-level chain. A single `donate(C)` should walk both hops,
    /// raising both B and A to C's priority.
    #[test]
    fn three_level_donation_chain_raises_every_holder() {
        super::super::with_test_scheduler(|| {
            push_thread(1, 10); // A
            push_thread(2, 20); // B
            push_thread(3, 30); // C

            set_lock_owner(100, ThreadId(1)); // L1 held by A
            set_lock_owner(200, ThreadId(2)); // L2 held by B

            super::super::with_scheduler_mut(|scheduler| {
                if let Some(b) = scheduler.threads.iter_mut().find(|t| t.id == ThreadId(2)) {
                    b.wait_on_lock = Some(100);
                }
                if let Some(c) = scheduler.threads.iter_mut().find(|t| t.id == ThreadId(3)) {
                    c.wait_on_lock = Some(200);
                }
            });

            donate(ThreadId(3));

            assert_eq!(effective_priority(1), 30);
            assert_eq!(effective_priority(2), 30);
            assert_eq!(effective_priority(3), 30);

            clear_lock_owner(100);
            clear_lock_owner(200);
        });
    }

    /// Once a donor stops actively waiting on the lock it donated through
    /// (e.g. it acquired a different lock instead), `recompute` should drop
    /// its donation and fall back to the owner's own base priority.
    #[test]
    fn recompute_drops_stale_donor() {
        super::super::with_test_scheduler(|| {
            push_thread(10, 5); // owner
            push_thread(11, 40); // donor

            set_lock_owner(300, ThreadId(10));
            super::super::with_scheduler_mut(|scheduler| {
                if let Some(donor) = scheduler.threads.iter_mut().find(|t| t.id == ThreadId(11)) {
                    donor.wait_on_lock = Some(300);
                }
            });

            donate(ThreadId(11));
            assert_eq!(effective_priority(10), 40);

            // Donor gives up on lock 300 (e.g. timed out) without releasing it.
            super::super::with_scheduler_mut(|scheduler| {
                if let Some(donor) = scheduler.threads.iter_mut().find(|t| t.id == ThreadId(11)) {
                    donor.wait_on_lock = None;
                }
            });

            recompute(ThreadId(10));
            assert_eq!(effective_priority(10), 5);

            clear_lock_owner(300);
        });
    }
}
