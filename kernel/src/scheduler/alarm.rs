/*
 * Alarm / Sleep Subsystem
 *
 * Tick-driven sleep queue: threads record the tick at which they should
 * wake and block; `on_tick()` (called from the timer interrupt) scans the
 * list each tick and wakes anyone whose deadline has passed.
 *
 * The sleep list is kept as a plain unsorted Vec and scanned in full on
 * every tick rather than kept sorted by wakeup time. With CLUU's thread
 * counts (tens, not thousands) a linear scan every ~10ms is cheaper than
 * maintaining a sorted structure, and it keeps `sleep`/`on_tick` trivially
 * correct.
 */

use alloc::vec::Vec;

use spin::Mutex;

use super::{BlockReason, SchedulerManager, ThreadId};

struct Sleeper {
    tid: ThreadId,
    wake_at_tick: u64,
}

static SLEEPERS: Mutex<Vec<Sleeper>> = Mutex::new(Vec::new());

/// Put the current thread to sleep for `ticks` timer ticks.
///
/// A `ticks` of 0 returns immediately without yielding, matching the
/// convention that `sleep(0)` is a no-op rather than an indefinite block.
pub fn sleep(ticks: u64) {
    if ticks == 0 {
        return;
    }

    let tid = super::current_thread_id();
    if tid.0 == 0 {
        // Idle/kernel thread: sleeping here would stop the whole system.
        return;
    }

    let wake_at_tick = current_tick().saturating_add(ticks);

    {
        let mut sleepers = SLEEPERS.lock();
        sleepers.push(Sleeper { tid, wake_at_tick });
    }

    super::with_scheduler_mut(|s| {
        if let Some(t) = s.threads.iter_mut().find(|t| t.id == tid) {
            t.wakeup_tick = wake_at_tick;
        }
    });

    loop {
        SchedulerManager::block_current_with_reason(BlockReason::Sleeping {
            until_tick: wake_at_tick,
        });
        SchedulerManager::yield_now();

        if current_tick() >= wake_at_tick {
            break;
        }
        // Spurious wakeup (shouldn't happen under normal operation, but
        // block_current_with_reason doesn't itself guarantee a sleep-only
        // wakeup source); re-block until our deadline actually passes.
    }
}

/// Current tick count, as tracked by the active scheduler core.
fn current_tick() -> u64 {
    super::with_scheduler_and_core(|_scheduler, core| core.total_ticks(super::CpuId::BSP))
}

/// Called once per timer tick. Wakes every sleeper whose deadline has
/// passed. Must not block; runs with interrupts disabled in IRQ context.
pub fn on_tick() {
    let now = current_tick();

    let due: Vec<ThreadId> = {
        let mut sleepers = SLEEPERS.lock();
        let mut due = Vec::new();
        sleepers.retain(|s| {
            if now >= s.wake_at_tick {
                due.push(s.tid);
                false
            } else {
                true
            }
        });
        due
    };

    for tid in due {
        super::with_scheduler_mut(|s| {
            if let Some(t) = s.threads.iter_mut().find(|t| t.id == tid) {
                t.wakeup_tick = 0;
            }
        });
        super::wake_thread(tid);
    }
}

/// Real-time sleep in milliseconds, rounded up to the nearest whole tick
/// (ticks run at 100Hz, i.e. 10ms each).
pub fn sleep_ms(ms: u64) {
    const MS_PER_TICK: u64 = 10;
    let ticks = (ms + MS_PER_TICK - 1) / MS_PER_TICK;
    sleep(ticks);
}
