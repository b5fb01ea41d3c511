/*
 * Multi-Level Feedback Queue Scheduler (MLFQS)
 *
 * Selected at boot with the `-o mlfqs` kernel argument in place of the
 * default priority-donation policy. Threads' priorities are derived
 * automatically from recent CPU usage and niceness rather than being set
 * directly or donated; `set_nice`/direct priority syscalls are rejected
 * while this policy is active (see `super::mlfqs_enabled`).
 *
 * All math uses 17.14 fixed-point, matching the reference formulas:
 *
 *   load_avg  := (59/60) * load_avg + (1/60) * ready_threads
 *   recent_cpu:= (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice
 *   priority  := PRI_MAX - (recent_cpu / 4) - (nice * 2)
 *
 * `recent_cpu` is incremented by 1 every tick for the running thread,
 * recomputed for every thread once per second, and priorities are
 * recomputed for every thread every 4 ticks.
 */

use alloc::collections::VecDeque;

use spin::Mutex;

use super::thread::{NICE_MAX, NICE_MIN, PRI_MAX, PRI_MIN};
use super::{
    events::SchedEvent,
    traits::{KernelSchedCtx, Scheduler},
    types::{CpuId, DispatchDecision, TimeSliceTicks},
    SchedulerMode, ThreadId,
};

/// Fixed-point scale: 2^14, per the 17.14 format.
const FP_SHIFT: i32 = 14;
const FP_ONE: i32 = 1 << FP_SHIFT;

fn int_to_fp(n: i32) -> i32 {
    n << FP_SHIFT
}

fn fp_round_to_int(x: i32) -> i32 {
    if x >= 0 {
        (x + FP_ONE / 2) >> FP_SHIFT
    } else {
        -((-x + FP_ONE / 2) >> FP_SHIFT)
    }
}

fn fp_mul(x: i32, y: i32) -> i32 {
    (((x as i64) * (y as i64)) >> FP_SHIFT) as i32
}

fn fp_div(x: i32, y: i32) -> i32 {
    (((x as i64) << FP_SHIFT) / (y as i64)) as i32
}

/// System-wide load average, 17.14 fixed-point. Recomputed once per second.
static LOAD_AVG: Mutex<i32> = Mutex::new(0);

/// Ticks elapsed (mirrors `SchedulerCore::total_ticks`, tracked locally so
/// MLFQS bookkeeping doesn't need a `SchedContext` for every tick).
static TICKS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

const TICKS_PER_SECOND: u64 = 100;
const PRIORITY_RECOMPUTE_INTERVAL: u64 = 4;

/// Get the current system load average, scaled by 100 and rounded, as the
/// `sys_get_load_avg` syscall reports it.
pub fn get_load_avg_x100() -> i32 {
    fp_round_to_int(fp_mul(*LOAD_AVG.lock(), int_to_fp(100)))
}

/// Get a thread's recent CPU usage, scaled by 100 and rounded, as the
/// `sys_get_recent_cpu` syscall reports it.
pub fn get_recent_cpu_x100(tid: ThreadId) -> i32 {
    super::with_scheduler(|s| {
        s.threads
            .iter()
            .find(|t| t.id == tid)
            .map(|t| fp_round_to_int(fp_mul(t.recent_cpu, int_to_fp(100))))
            .unwrap_or(0)
    })
}

/// Set a thread's niceness. Takes effect lazily: priority is not
/// recomputed until the next 4-tick boundary, matching the reference
/// scheduler's behavior of only recomputing on its regular schedule.
pub fn set_nice(tid: ThreadId, nice: i32) {
    let clamped = nice.clamp(NICE_MIN as i32, NICE_MAX as i32) as i8;
    super::with_scheduler_mut(|s| {
        if let Some(t) = s.threads.iter_mut().find(|t| t.id == tid) {
            t.nice = clamped;
        }
    });
}

pub fn get_nice(tid: ThreadId) -> i32 {
    super::with_scheduler(|s| {
        s.threads
            .iter()
            .find(|t| t.id == tid)
            .map(|t| t.nice as i32)
            .unwrap_or(0)
    })
}

fn recompute_priority(recent_cpu: i32, nice: i8) -> u8 {
    let pri = int_to_fp(PRI_MAX as i32)
        - fp_div(recent_cpu, int_to_fp(4))
        - int_to_fp(nice as i32 * 2);
    fp_round_to_int(pri).clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
}

/// Called once per timer tick while MLFQS is active. Advances the running
/// thread's `recent_cpu`, and every second (or every 4 ticks) recomputes
/// `load_avg`/`recent_cpu`/priorities across all threads.
pub fn on_tick(current: Option<ThreadId>) {
    let tick = TICKS.fetch_add(1, core::sync::atomic::Ordering::Relaxed) + 1;

    if let Some(tid) = current {
        if tid.0 != 0 {
            super::with_scheduler_mut(|s| {
                if let Some(t) = s.threads.iter_mut().find(|t| t.id == tid) {
                    t.recent_cpu = t.recent_cpu.saturating_add(FP_ONE);
                }
            });
        }
    }

    if tick % TICKS_PER_SECOND == 0 {
        recompute_load_avg_and_recent_cpu();
    }

    if tick % PRIORITY_RECOMPUTE_INTERVAL == 0 {
        recompute_all_priorities();
    }
}

fn recompute_load_avg_and_recent_cpu() {
    super::with_scheduler_mut(|s| {
        let ready_count = s
            .threads
            .iter()
            .filter(|t| t.state == super::ThreadState::Ready)
            .count() as i32;
        let running_is_not_idle = s
            .threads
            .iter()
            .any(|t| t.state == super::ThreadState::Running && t.id.0 != 0);
        let ready_threads = ready_count + if running_is_not_idle { 1 } else { 0 };

        let mut load_avg = LOAD_AVG.lock();
        // (59/60) * load_avg + (1/60) * ready_threads
        let coeff_59_60 = fp_div(int_to_fp(59), int_to_fp(60));
        let coeff_1_60 = fp_div(int_to_fp(1), int_to_fp(60));
        *load_avg = fp_mul(coeff_59_60, *load_avg) + fp_mul(coeff_1_60, int_to_fp(ready_threads));

        let two_load_avg = fp_mul(int_to_fp(2), *load_avg);
        let coeff = fp_div(two_load_avg, two_load_avg + FP_ONE);

        for t in s.threads.iter_mut() {
            if t.id.0 == 0 {
                continue;
            }
            t.recent_cpu = fp_mul(coeff, t.recent_cpu) + int_to_fp(t.nice as i32);
        }
    });
}

fn recompute_all_priorities() {
    super::with_scheduler_mut(|s| {
        for t in s.threads.iter_mut() {
            if t.id.0 == 0 {
                continue;
            }
            let pri = recompute_priority(t.recent_cpu, t.nice);
            t.base_priority = pri;
            t.effective_priority = pri;
        }
    });
}

/// Scheduling policy backing `-o mlfqs`: same priority-ordered dispatch as
/// `PriorityPolicy`, but priority comes from the recent-cpu/nice formula
/// above instead of from donation (MLFQS ignores donation entirely).
pub struct MlfqsPolicy {
    ready_queue: VecDeque<ThreadId>,
    mode: SchedulerMode,
}

impl MlfqsPolicy {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
            mode: SchedulerMode::Boot {
                critical_count: 0,
                ready_count: 0,
            },
        }
    }

    fn pick_highest(&mut self, ctx: &mut dyn KernelSchedCtx, boot_filter: bool) -> Option<ThreadId> {
        let mut best_idx = None;
        let mut best_priority = i32::MIN;

        for (idx, &tid) in self.ready_queue.iter().enumerate() {
            if !ctx.is_runnable(tid) {
                continue;
            }

            if boot_filter {
                let is_kernel_or_critical = tid.0 == 0
                    || ctx
                        .thread_process(tid)
                        .map(|pid| ctx.is_critical_process(pid))
                        .unwrap_or(false);
                if !is_kernel_or_critical {
                    continue;
                }
            }

            let priority = ctx.thread_priority(tid).map(|p| p.0).unwrap_or(0);
            if priority > best_priority {
                best_priority = priority;
                best_idx = Some(idx);
            }
        }

        let idx = best_idx?;
        let tid = self.ready_queue.remove(idx)?;
        self.ready_queue.push_back(tid);
        Some(tid)
    }
}

impl Scheduler for MlfqsPolicy {
    fn on_event(&mut self, _ctx: &mut dyn KernelSchedCtx, event: SchedEvent) {
        match event {
            SchedEvent::ThreadCreated { tid, .. } | SchedEvent::ThreadWoke { tid, .. } => {
                if !self.ready_queue.contains(&tid) {
                    self.ready_queue.push_back(tid);
                }
            }
            SchedEvent::ThreadBlocked { tid, .. } | SchedEvent::ThreadExited { tid, .. } => {
                self.ready_queue.retain(|&id| id != tid);
            }
            SchedEvent::ModeChanged { new_mode, .. } => {
                self.mode = new_mode;
            }
            SchedEvent::Tick { current_thread, .. } => {
                on_tick(current_thread);
            }
            _ => {}
        }
    }

    fn pick_next(&mut self, ctx: &mut dyn KernelSchedCtx, _cpu: CpuId) -> DispatchDecision {
        let boot_filter = matches!(self.mode, SchedulerMode::Boot { .. });

        match self.pick_highest(ctx, boot_filter) {
            Some(tid) => DispatchDecision::run_thread(tid, TimeSliceTicks::MLFQS),
            None => DispatchDecision::idle(),
        }
    }

    fn on_switched(
        &mut self,
        _ctx: &mut dyn KernelSchedCtx,
        _cpu: CpuId,
        _prev: Option<ThreadId>,
        _next: Option<ThreadId>,
    ) {
    }

    fn name(&self) -> &'static str {
        "MLFQS"
    }
}

impl Default for MlfqsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp_round_trip_exact() {
        assert_eq!(fp_round_to_int(int_to_fp(5)), 5);
        assert_eq!(fp_round_to_int(int_to_fp(-5)), -5);
        assert_eq!(fp_round_to_int(int_to_fp(0)), 0);
    }

    #[test]
    fn fp_round_to_int_rounds_to_nearest() {
        // 3.5 ticks of FP_ONE rounds away from zero per the reference
        // scheduler's rounding rule.
        let three_and_half = int_to_fp(3) + FP_ONE / 2;
        assert_eq!(fp_round_to_int(three_and_half), 4);
        assert_eq!(fp_round_to_int(-three_and_half), -4);
    }

    #[test]
    fn fp_mul_div_are_inverses() {
        let x = int_to_fp(7);
        let y = int_to_fp(2);
        assert_eq!(fp_round_to_int(fp_div(fp_mul(x, y), y)), 7);
    }

    #[test]
    fn priority_decreases_with_recent_cpu_and_nice() {
        let base = recompute_priority(0, 0);
        assert_eq!(base, PRI_MAX);

        let with_cpu = recompute_priority(int_to_fp(8), 0);
        assert_eq!(with_cpu, PRI_MAX - 2);

        let with_nice = recompute_priority(0, 5);
        assert_eq!(with_nice, PRI_MAX - 10);
    }

    #[test]
    fn priority_clamps_to_valid_range() {
        let very_high_cpu = recompute_priority(int_to_fp(1000), NICE_MAX);
        assert_eq!(very_high_cpu, PRI_MIN);
    }
}
