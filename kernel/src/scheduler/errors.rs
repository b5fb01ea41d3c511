/*
 * Scheduler/Process Error Types
 *
 * Small explicit error enums for the fallible scheduler-adjacent operations
 * (spawning threads, acquiring locks, process fork/exec/wait, page faults),
 * mirroring the shape of `loaders::elf::ElfLoadError`.
 */

use core::fmt;

use super::ProcessId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpawnError {
    TooManyThreads,
    TooManyProcesses,
    OutOfMemory,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::TooManyThreads => write!(f, "thread table is full"),
            SpawnError::TooManyProcesses => write!(f, "process table is full"),
            SpawnError::OutOfMemory => write!(f, "out of memory allocating thread/process state"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockError {
    AlreadyHeld,
    NotHeld,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyHeld => write!(f, "lock already held by the calling thread"),
            LockError::NotHeld => write!(f, "lock not held by the calling thread"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForkError {
    OutOfMemory,
    TooManyProcesses,
    LoadFailed,
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::OutOfMemory => write!(f, "out of memory duplicating address space"),
            ForkError::TooManyProcesses => write!(f, "process table is full"),
            ForkError::LoadFailed => write!(f, "child failed during post-fork initialization"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidElf,
    OutOfMemory,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "executable not found"),
            ExecError::InvalidElf => write!(f, "executable is not a valid ELF binary"),
            ExecError::OutOfMemory => write!(f, "out of memory loading executable"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitError {
    NotAChild(ProcessId),
    AlreadyWaitedOn(ProcessId),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::NotAChild(pid) => write!(f, "process {} is not a child of the caller", pid.0),
            WaitError::AlreadyWaitedOn(pid) => write!(f, "process {} has already been waited on", pid.0),
        }
    }
}

/// Outcome of resolving a page fault against a thread's supplemental page
/// table. `Handled` means the fault was satisfied (page loaded/allocated)
/// and the faulting instruction can be retried; `Fatal` means the access
/// was genuinely invalid and the owning process must be killed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageFaultOutcome {
    Handled,
    Fatal(PageFaultReason),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageFaultReason {
    NoMapping,
    OutOfMemory,
    StackOverflow,
    WriteToReadOnly,
}

impl fmt::Display for PageFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageFaultReason::NoMapping => write!(f, "no supplemental page table entry for this address"),
            PageFaultReason::OutOfMemory => write!(f, "out of memory servicing page fault"),
            PageFaultReason::StackOverflow => write!(f, "stack grew past its size limit"),
            PageFaultReason::WriteToReadOnly => write!(f, "write to a read-only page"),
        }
    }
}
