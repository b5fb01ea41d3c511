/*
 * Preemptive Scheduler - Module Root
 *
 * This is the glue layer tying together the mechanism/policy split scheduler:
 *
 * - thread.rs / process.rs: the Thread and Process abstractions
 * - scheduler.rs: Scheduler, the mechanism's owning data structure
 * - sched_core.rs: SchedulerCore, the stable external API and event dispatcher
 * - traits.rs: Scheduler (policy) and KernelSchedCtx (mechanism-facing context)
 * - context.rs: SchedContext, the KernelSchedCtx implementation
 * - events.rs / types.rs: the event and value types shared across the split
 * - policies/: swappable scheduling algorithms (round-robin, priority, MLFQS)
 * - priority.rs: priority donation bookkeeping
 * - sync.rs: Semaphore/Lock/CondVar built on top of the scheduler
 * - alarm.rs: tick-driven sleep queue and real-time sleep
 * - mlfqs.rs: 17.14 fixed-point load average / recent CPU accounting
 *
 * This module also owns the naked-assembly interrupt entry points
 * (`yield_interrupt_handler`, `preemptive_timer_interrupt_handler`) because
 * they must live at a stable, `transmute`-friendly path: arch::x86_64::idt
 * wires the IDT directly to `crate::scheduler::{yield_interrupt_handler,
 * preemptive_timer_interrupt_handler}`.
 */

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

pub mod alarm;
pub mod context;
pub mod errors;
pub mod events;
pub mod io_wait;
pub mod ipc;
pub mod mlfqs;
pub mod policies;
pub mod priority;
pub mod process;
pub mod sched_core;
pub mod scheduler;
pub mod scheduler_manager;
pub mod sync;
pub mod thread;
pub mod traits;
pub mod types;

pub use context::SchedContext;
pub use errors::{ExecError, ForkError, LockError, PageFaultOutcome, SpawnError, WaitError};
pub use events::SchedEvent;
pub use io_wait::{wait_for_io, wake_io_waiters, IoChannel};
pub use process::{Process, ProcessId, ProcessManager, ProcessState};
pub use sched_core::SchedulerCore;
pub use scheduler::InterruptContext;
pub use scheduler_manager::SchedulerManager;
pub use sync::{CondVar, Lock, Semaphore};
pub use thread::{Thread, ThreadId, ThreadState};
pub use traits::{KernelSchedCtx, Scheduler};
pub use types::{BlockReason, CpuId, DispatchDecision, Priority, SchedClass, TimeSliceTicks};

pub use mlfqs::MlfqsPolicy;
pub use policies::{PriorityPolicy, RoundRobinPolicy};

/// Lifecycle hook every manager-style ZST (SchedulerManager, and in future
/// other kernel subsystems) implements so boot code can initialize them
/// uniformly.
pub trait KernelComponent {
    fn init();
}

/// Scheduler operating mode
///
/// During boot, only processes registered as `Critical` are scheduled, so
/// that servers like the VFS can finish initializing before user code runs.
/// Once every critical process has signaled ready, the scheduler transitions
/// to `Normal` and never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Boot {
        critical_count: usize,
        ready_count: usize,
    },
    Normal,
}

/// Process classification
///
/// Drives the initial thread priority assigned at creation time (subject to
/// later donation and, under MLFQS, recent-CPU-driven recomputation) and
/// which processes are allowed to run during `SchedulerMode::Boot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    /// Boot-critical servers (VFS, ...). Scheduled during Boot mode.
    Critical,
    /// Kernel-owned system processes (PID 0).
    System,
    /// Ordinary userspace processes.
    User,
    /// Time-sensitive userspace processes that want a priority boost.
    RealTime,
}

impl ProcessType {
    /// Initial thread priority for a freshly created process of this type,
    /// in the [PRI_MIN, PRI_MAX] range used by the priority scheduler.
    pub fn base_priority(&self) -> u8 {
        match self {
            ProcessType::Critical => thread::PRI_MAX,
            ProcessType::System => 50,
            ProcessType::RealTime => 55,
            ProcessType::User => thread::PRI_DEFAULT,
        }
    }
}

/// Initialization state of a process, used during the boot handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessInitState {
    Initializing,
    Ready,
}

/// Global scheduler instance (mechanism data: threads, processes, mode)
static SCHEDULER: Mutex<Option<scheduler::Scheduler>> = Mutex::new(None);

/// Global scheduler core (active policy + per-CPU state)
static SCHEDULER_CORE: Mutex<Option<SchedulerCore>> = Mutex::new(None);

/// Current running thread ID (atomic for IRQ safety)
static CURRENT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Scheduler enabled flag
static SCHEDULER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Preemption disabled flag (set during critical scheduler operations)
static PREEMPTION_DISABLED: AtomicBool = AtomicBool::new(false);

/// Whether the `-o mlfqs` boot flag selected the MLFQS policy. Read-only
/// after `SchedulerManager::init()`; set exactly once.
static MLFQS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Check whether the MLFQS policy is active.
///
/// Threads consult this before letting the user adjust priority directly:
/// under MLFQS, priority is derived from `nice`/`recent_cpu` and direct
/// `set_priority` calls are rejected.
pub fn mlfqs_enabled() -> bool {
    MLFQS_ENABLED.load(Ordering::Relaxed)
}

/// Virtual address BOOTBOOT maps the environment text (from the initrd's
/// `sys/config`) to, per the protocol's fixed environment window.
const BOOTBOOT_ENV_ADDR: usize = 0xffff_ffff_ffe0_0000;
const BOOTBOOT_ENV_SIZE: usize = 4096;

/// Scan BOOTBOOT's environment text for a `kernel=... -o mlfqs ...`-style
/// `-o mlfqs` flag and latch the result.
///
/// Called once from `SchedulerManager::init()`, before any policy is chosen.
fn detect_mlfqs_flag() -> bool {
    let env = unsafe {
        let bytes = core::slice::from_raw_parts(BOOTBOOT_ENV_ADDR as *const u8, BOOTBOOT_ENV_SIZE);
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..len]).unwrap_or("")
    };

    env.split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .any(|w| w[0] == "-o" && w[1] == "mlfqs")
}

/// Test-only: install a fresh `Scheduler` as the global singleton for the
/// duration of `f`, then clear it. Lets mechanism-level unit tests (priority
/// donation, ready-queue ordering) exercise `with_scheduler`/`with_scheduler_mut`
/// directly without going through `SchedulerManager::init()`'s hardware setup.
#[cfg(test)]
pub(crate) fn with_test_scheduler<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    *SCHEDULER.lock() = Some(scheduler::Scheduler::new());
    let result = f();
    *SCHEDULER.lock() = None;
    result
}

/// Run a closure with read access to the scheduler's mechanism data.
///
/// # Panics
/// Panics if called before `SchedulerManager::init()`.
pub fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&scheduler::Scheduler) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let guard = SCHEDULER.lock();
        let s = guard.as_ref().expect("scheduler not initialized");
        f(s)
    })
}

/// Run a closure with mutable access to the scheduler's mechanism data.
///
/// # Panics
/// Panics if called before `SchedulerManager::init()`.
pub fn with_scheduler_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut scheduler::Scheduler) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let s = guard.as_mut().expect("scheduler not initialized");
        f(s)
    })
}

/// Run a closure with mutable access to both the scheduler and its core.
///
/// Used whenever a mechanism-level operation (block, wake, priority change)
/// must also notify the active policy via a `SchedContext`.
///
/// # Panics
/// Panics if called before `SchedulerManager::init()`.
pub fn with_scheduler_and_core<F, R>(f: F) -> R
where
    F: FnOnce(&mut scheduler::Scheduler, &mut SchedulerCore) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched_guard = SCHEDULER.lock();
        let mut core_guard = SCHEDULER_CORE.lock();
        let scheduler = sched_guard.as_mut().expect("scheduler not initialized");
        let core = core_guard.as_mut().expect("scheduler core not initialized");
        f(scheduler, core)
    })
}

/// Convenience wrapper over `ProcessManager::with_current_mut` for non-scheduler
/// callers (notably the page fault handler) that only need the process, not
/// the scheduler machinery around it.
pub fn with_current_process_mut<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut process::Process) -> R,
{
    process::ProcessManager::with_current_mut(f)
}

/// Look up a thread's name, for logging at points where only the ID is handy.
fn get_thread_name(tid: ThreadId) -> Option<String> {
    with_scheduler(|s| s.threads.iter().find(|t| t.id == tid).map(|t| t.name.clone()))
}

/// Current thread ID, readable without taking any locks (IRQ-safe).
pub fn current_thread_id() -> ThreadId {
    ThreadId(CURRENT_THREAD_ID.load(Ordering::SeqCst))
}

/// Block the current thread. Thin wrapper kept for callers (io_wait, ipc)
/// that predate `SchedulerManager` and address the scheduler through free
/// functions rather than the manager ZST.
pub fn block_current_thread() {
    SchedulerManager::block_current();
}

/// Wake a blocked thread. See `block_current_thread`.
pub fn wake_thread(tid: ThreadId) {
    SchedulerManager::wake(tid);
}

/// Voluntarily yield the CPU. See `block_current_thread`.
pub fn yield_now() {
    SchedulerManager::yield_now();
}

/// Per-thread runtime statistics, returned by `ThreadManager::stats()`.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub cpu_time_ms: u64,
    pub cpu_percent: u64,
}

pub use thread::ThreadManager;

/// Built-in idle thread: runs only when no other thread is runnable.
fn idle_thread_main() {
    loop {
        x86_64::instructions::hlt();
    }
}

// ============================================================================
// INTERRUPT ENTRY POINTS
// ============================================================================

/// Voluntary-yield entry point (`int 0x81`).
///
/// Identical in structure to the timer handler below, minus the PIC EOI
/// (software interrupts don't go through the PIC).
#[unsafe(naked)]
pub unsafe extern "C" fn yield_interrupt_handler() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {schedule_fn}",
        "mov rsp, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        schedule_fn = sym schedule_from_interrupt,
    )
}

/// Timer (IRQ0) entry point: saves the full interrupt context, asks the
/// mechanism for the next thread, restores its context, sends EOI, resumes
/// via `iretq`.
#[unsafe(naked)]
pub unsafe extern "C" fn preemptive_timer_interrupt_handler() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {schedule_fn}",
        "mov rsp, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "push rax",
        "mov al, 0x20",
        "out 0x20, al",
        "pop rax",
        "iretq",
        schedule_fn = sym schedule_from_interrupt,
    )
}

/// Scheduling core called from the naked interrupt handlers.
///
/// Drives the tick accounting, the alarm wakeup scan, and the policy's
/// `pick_next` decision, then saves/restores `InterruptContext` between the
/// previous and next thread exactly like the legacy round-robin handler did.
///
/// Runs with interrupts disabled; must not block.
#[unsafe(no_mangle)]
pub extern "C" fn schedule_from_interrupt(
    current_ctx_ptr: *const InterruptContext,
) -> *const InterruptContext {
    if !SCHEDULER_ENABLED.load(Ordering::SeqCst) {
        return current_ctx_ptr;
    }

    if PREEMPTION_DISABLED.load(Ordering::SeqCst) {
        crate::utils::timer::on_timer_interrupt();
        return current_ctx_ptr;
    }

    crate::utils::timer::on_timer_interrupt();
    alarm::on_tick();

    let mut sched_guard = SCHEDULER.lock();
    let mut core_guard = SCHEDULER_CORE.lock();
    let (scheduler, core) = match (sched_guard.as_mut(), core_guard.as_mut()) {
        (Some(s), Some(c)) => (s, c),
        _ => return current_ctx_ptr,
    };

    let current_id = ThreadId(CURRENT_THREAD_ID.load(Ordering::SeqCst));

    // Save the outgoing thread's context and update its accounting before
    // asking the policy for the next one, so `pick_next` sees fresh state.
    let current_time = crate::utils::timer::uptime_ms();
    if current_id.0 != 0 {
        if let Some(current_thread) = scheduler.get_thread_mut(current_id) {
            unsafe {
                current_thread.interrupt_context = *current_ctx_ptr;
            }
            if current_thread.last_scheduled_time > 0 {
                let elapsed = current_time.saturating_sub(current_thread.last_scheduled_time);
                current_thread.cpu_time_ms = current_thread.cpu_time_ms.saturating_add(elapsed);
            }
            if current_thread.state == ThreadState::Running {
                current_thread.state = ThreadState::Ready;
            }
        }
    }

    {
        let mut ctx = SchedContext::new(scheduler, CpuId::BSP);
        core.on_tick(&mut ctx, CpuId::BSP);
    }

    let next_id = {
        let mut ctx = SchedContext::new(scheduler, CpuId::BSP);
        core.reschedule(&mut ctx, CpuId::BSP)
    };

    let next_id = match next_id {
        Some(id) => id,
        None => {
            // Nothing runnable; keep executing the current thread (or idle).
            if current_id.0 != 0 {
                if let Some(t) = scheduler.get_thread_mut(current_id) {
                    t.state = ThreadState::Running;
                }
            }
            return current_ctx_ptr;
        }
    };

    if current_id == next_id {
        if let Some(t) = scheduler.get_thread_mut(current_id) {
            t.state = ThreadState::Running;
        }
        return current_ctx_ptr;
    }

    let next_ctx_ptr = if let Some(next_thread) = scheduler.get_thread_mut(next_id) {
        next_thread.state = ThreadState::Running;
        next_thread.last_scheduled_time = current_time;
        &next_thread.interrupt_context as *const InterruptContext
    } else {
        return current_ctx_ptr;
    };

    CURRENT_THREAD_ID.store(next_id.0, Ordering::SeqCst);

    // Opportunistically reap terminated threads; safe here because we hold
    // both locks already and logging is suppressed (IRQ context).
    scheduler.cleanup_terminated_threads(next_id, false);

    next_ctx_ptr
}
