/*
 * Synchronization Primitives
 *
 * Semaphore, Lock (binary semaphore + owner, donation-aware), and CondVar
 * (Mesa-style monitor discipline), all built directly on the scheduler's
 * block/wake mechanism rather than on busy-waiting.
 *
 * Locks cooperate with priority.rs: a thread blocked trying to acquire a
 * held lock donates its priority to the lock's owner so that a
 * lower-priority holder isn't starved behind medium-priority threads
 * (priority inversion).
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{BlockReason, SchedulerManager, ThreadId};

/// Pick the highest-`effective_priority` waiter out of a FIFO queue,
/// removing and returning it. Ties break in FIFO order (the earlier waiter
/// in the deque wins) since `max_by_key` on an iterator keeps the first
/// maximum it sees when iterating front-to-back... actually Rust's
/// `max_by_key` returns the *last* maximal element, so we scan by index to
/// keep earliest-wins semantics.
fn pop_highest_priority(waiters: &mut VecDeque<ThreadId>) -> Option<ThreadId> {
    if waiters.is_empty() {
        return None;
    }

    let priorities: alloc::vec::Vec<u8> = super::with_scheduler(|s| {
        waiters
            .iter()
            .map(|tid| {
                s.threads
                    .iter()
                    .find(|t| t.id == *tid)
                    .map(|t| t.effective_priority)
                    .unwrap_or(0)
            })
            .collect()
    });

    let best_idx = priorities
        .iter()
        .enumerate()
        .max_by_key(|(idx, prio)| (**prio, core::cmp::Reverse(*idx)))
        .map(|(idx, _)| idx)?;

    waiters.remove(best_idx)
}

/// Counting semaphore with a priority-ordered waiter list.
pub struct Semaphore {
    inner: Mutex<SemInner>,
}

struct SemInner {
    value: isize,
    waiters: VecDeque<ThreadId>,
}

impl Semaphore {
    pub fn new(initial: isize) -> Self {
        Self {
            inner: Mutex::new(SemInner {
                value: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Block until the semaphore can be decremented.
    pub fn down(&self) {
        self.down_as(BlockReason::Other);
    }

    /// Same as `down`, but lets the caller attribute the block to a
    /// specific reason (used by `Lock` to report `WaitingForLock`).
    pub fn down_as(&self, reason: BlockReason) {
        let me = super::current_thread_id();
        loop {
            if self.try_down() {
                return;
            }

            {
                let mut inner = self.inner.lock();
                // Re-check under the lock: another `up()` may have run
                // between our failed try_down and taking this lock.
                if inner.value > 0 {
                    inner.value -= 1;
                    return;
                }
                if !inner.waiters.contains(&me) {
                    inner.waiters.push_back(me);
                }
            }

            SchedulerManager::block_current_with_reason(reason);
            SchedulerManager::yield_now();
        }
    }

    /// Decrement without blocking if the semaphore is already available.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increment, waking the highest-priority waiter if any.
    pub fn up(&self) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.value += 1;
            pop_highest_priority(&mut inner.waiters)
        };
        if let Some(tid) = woken {
            super::wake_thread(tid);
        }
    }

    /// Current value, for diagnostics/tests only.
    pub fn value(&self) -> isize {
        self.inner.lock().value
    }
}

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

/// Mutual-exclusion lock: a binary semaphore plus an owner, supporting
/// priority donation while a thread waits for a held lock.
pub struct Lock {
    id: usize,
    sema: Semaphore,
    owner: Mutex<Option<ThreadId>>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            sema: Semaphore::new(1),
            owner: Mutex::new(None),
        }
    }

    /// Unique ID for this lock, used as the key in the donation chain
    /// (`Thread::wait_on_lock`) and in the lock-owner registry.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_held_by_current(&self) -> bool {
        *self.owner.lock() == Some(super::current_thread_id())
    }

    /// Acquire the lock, blocking (and donating priority) if it's held.
    ///
    /// # Panics
    /// Panics on recursive acquisition by the same thread (locks are not
    /// re-entrant).
    pub fn acquire(&self) {
        let me = super::current_thread_id();
        if self.is_held_by_current() {
            panic!("Lock::acquire: thread {} already holds this lock", me.0);
        }

        loop {
            if self.sema.try_down() {
                break;
            }

            {
                let mut inner_waiters = self.sema.inner.lock();
                if inner_waiters.value > 0 {
                    inner_waiters.value -= 1;
                    break;
                }
                if !inner_waiters.waiters.contains(&me) {
                    inner_waiters.waiters.push_back(me);
                }
            }

            super::with_scheduler_mut(|s| {
                if let Some(t) = s.threads.iter_mut().find(|t| t.id == me) {
                    t.wait_on_lock = Some(self.id);
                }
            });
            super::priority::donate(me);

            SchedulerManager::block_current_with_reason(BlockReason::WaitingForLock {
                lock_id: self.id,
            });
            SchedulerManager::yield_now();
        }

        super::with_scheduler_mut(|s| {
            if let Some(t) = s.threads.iter_mut().find(|t| t.id == me) {
                t.wait_on_lock = None;
            }
        });
        *self.owner.lock() = Some(me);
        super::priority::set_lock_owner(self.id, me);
    }

    /// Try to acquire without blocking.
    pub fn try_acquire(&self) -> bool {
        let me = super::current_thread_id();
        if self.is_held_by_current() {
            return false;
        }
        if self.sema.try_down() {
            *self.owner.lock() = Some(me);
            super::priority::set_lock_owner(self.id, me);
            true
        } else {
            false
        }
    }

    /// Release the lock, reverting any priority donated to the holder and
    /// waking the highest-priority waiter.
    ///
    /// # Panics
    /// Panics if the current thread doesn't hold the lock.
    pub fn release(&self) {
        let me = super::current_thread_id();
        if !self.is_held_by_current() {
            panic!("Lock::release: thread {} does not hold this lock", me.0);
        }
        *self.owner.lock() = None;
        super::priority::clear_lock_owner(self.id);
        super::priority::recompute(me);
        self.sema.up();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Mesa-style condition variable: `wait` atomically releases the
/// associated lock and blocks, reacquiring the lock before returning.
/// Waiters must re-check their condition in a loop after `wait` returns,
/// since `signal`/`broadcast` only guarantee a wakeup, not that the
/// condition still holds (another thread may run first).
pub struct CondVar {
    waiters: Mutex<VecDeque<(ThreadId, Arc<Semaphore>)>>,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Release `lock`, block until signaled, then reacquire `lock`.
    ///
    /// # Panics
    /// Panics (via `lock.release()`) if the caller doesn't hold `lock`.
    pub fn wait(&self, lock: &Lock) {
        let me = super::current_thread_id();
        let my_sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push_back((me, my_sema.clone()));

        lock.release();
        my_sema.down();
        lock.acquire();
    }

    /// Wake the single highest-priority waiter, if any.
    pub fn signal(&self) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }

        let priorities: alloc::vec::Vec<u8> = super::with_scheduler(|s| {
            waiters
                .iter()
                .map(|(tid, _)| {
                    s.threads
                        .iter()
                        .find(|t| t.id == *tid)
                        .map(|t| t.effective_priority)
                        .unwrap_or(0)
                })
                .collect()
        });

        let best_idx = match priorities
            .iter()
            .enumerate()
            .max_by_key(|(idx, prio)| (**prio, core::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)
        {
            Some(idx) => idx,
            None => return,
        };

        if let Some((_, sema)) = waiters.remove(best_idx) {
            sema.up();
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        while let Some((_, sema)) = waiters.pop_front() {
            sema.up();
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
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

    #[test]
    fn pop_highest_priority_prefers_priority_over_arrival() {
        super::super::with_test_scheduler(|| {
            push_thread(1, 10);
            push_thread(2, 50);
            push_thread(3, 30);

            let mut waiters: VecDeque<ThreadId> = VecDeque::new();
            waiters.push_back(ThreadId(1));
            waiters.push_back(ThreadId(2));
            waiters.push_back(ThreadId(3));

            assert_eq!(pop_highest_priority(&mut waiters), Some(ThreadId(2)));
            assert_eq!(pop_highest_priority(&mut waiters), Some(ThreadId(3)));
            assert_eq!(pop_highest_priority(&mut waiters), Some(ThreadId(1)));
            assert_eq!(pop_highest_priority(&mut waiters), None);
        });
    }

    /// Spec Scenario 1: equal-priority waiters are served in arrival order.
    #[test]
    fn pop_highest_priority_breaks_ties_fifo() {
        super::super::with_test_scheduler(|| {
            push_thread(1, 20);
            push_thread(2, 20);

            let mut waiters: VecDeque<ThreadId> = VecDeque::new();
            waiters.push_back(ThreadId(1));
            waiters.push_back(ThreadId(2));

            assert_eq!(pop_highest_priority(&mut waiters), Some(ThreadId(1)));
            assert_eq!(pop_highest_priority(&mut waiters), Some(ThreadId(2)));
        });
    }
}
