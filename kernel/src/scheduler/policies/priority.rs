/*
 * Priority Scheduling Policy
 *
 * Strict priority scheduling with FIFO ordering among threads at the same
 * priority level. This is CLUU's default policy (unless `-o mlfqs` selects
 * MlfqsPolicy at boot): always runs the highest-priority runnable thread,
 * and a thread only yields to one of equal priority after its time slice
 * expires or it voluntarily yields.
 *
 * Priority here is `Thread::effective_priority`, which already reflects
 * any donation performed by `scheduler::priority::donate` when a thread
 * is waiting on a lock held by this one - the policy itself doesn't know
 * or care about donation, it just reads whatever priority `ctx` reports.
 */

use alloc::collections::VecDeque;

use super::super::{
    SchedulerMode, ThreadId,
    events::SchedEvent,
    traits::{KernelSchedCtx, Scheduler},
    types::{CpuId, DispatchDecision, TimeSliceTicks},
};

/// Priority scheduling policy
pub struct PriorityPolicy {
    /// All threads known to be ready, in the order they became ready
    /// (used only to break ties between threads at the same priority).
    ready_queue: VecDeque<ThreadId>,

    mode: SchedulerMode,
}

impl PriorityPolicy {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
            mode: SchedulerMode::Boot {
                critical_count: 0,
                ready_count: 0,
            },
        }
    }

    /// Pick the highest-priority runnable thread in the ready queue,
    /// breaking ties by queue order (earliest-ready wins), and rotate it
    /// to the back so a same-priority sibling gets a turn next time.
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

impl Scheduler for PriorityPolicy {
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

            _ => {}
        }
    }

    fn pick_next(&mut self, ctx: &mut dyn KernelSchedCtx, _cpu: CpuId) -> DispatchDecision {
        let boot_filter = matches!(self.mode, SchedulerMode::Boot { .. });

        match self.pick_highest(ctx, boot_filter) {
            Some(tid) => DispatchDecision::run_thread(tid, TimeSliceTicks::DEFAULT),
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
        "Priority"
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::{BTreeMap, BTreeSet};
    use alloc::vec::Vec;
    use super::super::super::{Priority, ProcessId, SchedClass, ThreadState};

    struct MockCtx {
        priorities: BTreeMap<ThreadId, i32>,
        runnable: BTreeSet<ThreadId>,
    }

    impl MockCtx {
        fn new() -> Self {
            Self {
                priorities: BTreeMap::new(),
                runnable: BTreeSet::new(),
            }
        }

        fn with(mut self, tid: ThreadId, priority: i32) -> Self {
            self.priorities.insert(tid, priority);
            self.runnable.insert(tid);
            self
        }
    }

    impl KernelSchedCtx for MockCtx {
        fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
            if self.runnable.contains(&tid) {
                Some(ThreadState::Ready)
            } else {
                None
            }
        }

        fn is_runnable(&self, tid: ThreadId) -> bool {
            self.runnable.contains(&tid)
        }

        fn current_thread(&self, _cpu: CpuId) -> Option<ThreadId> {
            None
        }

        fn thread_priority(&self, tid: ThreadId) -> Option<Priority> {
            self.priorities.get(&tid).copied().map(Priority)
        }

        fn thread_class(&self, _tid: ThreadId) -> Option<SchedClass> {
            None
        }

        fn thread_process(&self, _tid: ThreadId) -> Option<ProcessId> {
            None
        }

        fn is_critical_process(&self, _pid: ProcessId) -> bool {
            false
        }

        fn current_mode(&self) -> SchedulerMode {
            SchedulerMode::Normal
        }

        fn now_ticks(&self) -> u64 {
            0
        }

        fn cpu_count(&self) -> usize {
            1
        }

        fn all_threads(&self) -> Vec<ThreadId> {
            self.priorities.keys().copied().collect()
        }

        fn make_runnable(&mut self, _tid: ThreadId) {}
        fn request_reschedule(&mut self, _cpu: CpuId) {}
        fn set_thread_class(&mut self, _tid: ThreadId, _class: SchedClass) {}

        fn set_thread_priority(&mut self, tid: ThreadId, priority: Priority) {
            self.priorities.insert(tid, priority.0);
        }

        fn log(&self, _level: log::Level, _message: &str) {}
    }

    /// Spec Scenario 1: threads at the same priority run in the order they
    /// became ready, round-robining once everyone's had a turn.
    #[test]
    fn equal_priority_breaks_ties_by_arrival_order() {
        let mut policy = PriorityPolicy::new();
        policy.ready_queue.push_back(ThreadId(1));
        policy.ready_queue.push_back(ThreadId(2));
        policy.ready_queue.push_back(ThreadId(3));

        let mut ctx = MockCtx::new()
            .with(ThreadId(1), 30)
            .with(ThreadId(2), 30)
            .with(ThreadId(3), 30);

        assert_eq!(policy.pick_highest(&mut ctx, false), Some(ThreadId(1)));
        assert_eq!(policy.pick_highest(&mut ctx, false), Some(ThreadId(2)));
        assert_eq!(policy.pick_highest(&mut ctx, false), Some(ThreadId(3)));
        // Everyone's had a turn and been rotated to the back; thread 1 is up again.
        assert_eq!(policy.pick_highest(&mut ctx, false), Some(ThreadId(1)));
    }

    #[test]
    fn higher_priority_thread_wins_regardless_of_queue_order() {
        let mut policy = PriorityPolicy::new();
        policy.ready_queue.push_back(ThreadId(1));
        policy.ready_queue.push_back(ThreadId(2));

        let mut ctx = MockCtx::new().with(ThreadId(1), 10).with(ThreadId(2), 50);

        assert_eq!(policy.pick_highest(&mut ctx, false), Some(ThreadId(2)));
    }

    #[test]
    fn boot_filter_skips_non_critical_user_threads() {
        let mut policy = PriorityPolicy::new();
        policy.ready_queue.push_back(ThreadId(1)); // non-critical user thread
        policy.ready_queue.push_back(ThreadId(0)); // kernel/idle thread, always allowed

        let mut ctx = MockCtx::new().with(ThreadId(1), 60).with(ThreadId(0), 0);

        assert_eq!(policy.pick_highest(&mut ctx, true), Some(ThreadId(0)));
    }
}
