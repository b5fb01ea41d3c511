/*
 * Scheduling Policies Module
 *
 * This module contains different scheduling policy implementations.
 * Each policy implements the Scheduler trait and can be plugged into
 * the SchedulerCore at boot time.
 *
 * Available policies:
 * - RoundRobin: Simple preemptive round-robin (kept as reference)
 * - Priority: Strict priority with donation, default unless -o mlfqs is set
 * - Mlfqs: Multi-level feedback queue (`scheduler::mlfqs::MlfqsPolicy`),
 *   selected instead of Priority when booted with `-o mlfqs`
 * - (Future) Cfs: Completely Fair Scheduler (like Linux)
 * - (Future) Edf: Earliest Deadline First (for real-time)
 */

pub mod priority;
pub mod round_robin;

pub use priority::PriorityPolicy;
pub use round_robin::RoundRobinPolicy;
