//! The trace's unit of record (spec.md §3): every event carries a global
//! sequence number, a logical tid, a kind-specific payload, the retired-
//! branch count consumed since the tid's previous event, and a full
//! register snapshot at the event boundary.

use crate::registers::Registers;
use crate::ticks::Ticks;
use serde::{Deserialize, Serialize};

/// A memory region the kernel wrote into tracee memory on behalf of a
/// syscall, captured so the replayer can write it back without calling
/// the kernel (spec.md §3, §4.6, §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryDelta {
    pub address: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyscallEntry {
    pub number: i64,
    pub args: [u64; 6],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyscallExit {
    pub number: i64,
    pub result: i64,
    pub memory_deltas: Vec<MemoryDelta>,
    /// Set when the syscall was interrupted by a signal and must be
    /// restarted rather than treated as a completed exit (spec.md §3
    /// invariant 3).
    pub restart: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signo: i32,
    pub siginfo_bytes: Vec<u8>,
    pub delivered_at_branch_count: Ticks,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneEvent {
    pub new_logical_tid: u32,
    pub flags: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExitEvent {
    pub status: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitEvent {
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
    pub auxv: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventPayload {
    SyscallEntry(SyscallEntry),
    SyscallExit(SyscallExit),
    Signal(SignalEvent),
    Sched,
    Clone(CloneEvent),
    Exit(ExitEvent),
    Init(InitEvent),
}

impl EventPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventPayload::SyscallEntry(_) => "SYSCALL_ENTRY",
            EventPayload::SyscallExit(_) => "SYSCALL_EXIT",
            EventPayload::Signal(_) => "SIGNAL",
            EventPayload::Sched => "SCHED",
            EventPayload::Clone(_) => "CLONE",
            EventPayload::Exit(_) => "EXIT",
            EventPayload::Init(_) => "INIT",
        }
    }
}

/// A raw, non-portable snapshot of `libc::user_regs_struct`, stored
/// field-by-field so the trace codec doesn't depend on the host's exact
/// struct layout matching bit-for-bit across versions.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Default)]
pub struct RegisterSnapshot {
    pub rip: u64,
    pub rsp: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub eflags: u64,
    pub orig_rax: u64,
}

impl From<&Registers> for RegisterSnapshot {
    fn from(r: &Registers) -> Self {
        let raw = r.raw();
        RegisterSnapshot {
            rip: raw.rip,
            rsp: raw.rsp,
            rax: raw.rax,
            rbx: raw.rbx,
            rcx: raw.rcx,
            rdx: raw.rdx,
            rsi: raw.rsi,
            rdi: raw.rdi,
            rbp: raw.rbp,
            r8: raw.r8,
            r9: raw.r9,
            r10: raw.r10,
            r11: raw.r11,
            r12: raw.r12,
            r13: raw.r13,
            r14: raw.r14,
            r15: raw.r15,
            eflags: raw.eflags,
            orig_rax: raw.orig_rax,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub logical_tid: u32,
    pub ticks_since_prev: Ticks,
    pub regs: RegisterSnapshot,
    pub payload: EventPayload,
}
