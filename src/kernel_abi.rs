//! Host kernel ABI facts needed by the trace codec and the recorder and
//! replayer engines.
//!
//! The teacher carries a full `kernel_abi` module with parallel x86/x64
//! syscall tables behind a `SupportedArch` enum, because rr/rd replay
//! 32-bit tracees on a 64-bit host. That's explicitly out of scope here
//! (spec.md §1 Non-goals), so this is reduced to the one architecture tag
//! the trace header needs for its mismatch check (spec.md §7, §8 S6) plus
//! a handful of syscall-number predicates the recorder/replayer and the
//! syscall policy table build on.

use libc::{
    SYS_clone, SYS_execve, SYS_exit, SYS_exit_group, SYS_fork, SYS_restart_syscall, SYS_vfork,
    SYS_write,
};

/// Identifies the host ABI a trace was recorded on. Replaying a trace
/// whose tag doesn't match the host's is a `TraceFormat` error raised at
/// trace-open time, not at the first event (spec.md §8 S6).
pub const ARCH_TAG: &str = "x86_64-linux-gnu";

pub fn is_write_syscall(syscallno: i64) -> bool {
    syscallno == SYS_write
}

pub fn is_restart_syscall(syscallno: i64) -> bool {
    syscallno == SYS_restart_syscall
}

pub fn is_clone_family(syscallno: i64) -> bool {
    syscallno == SYS_clone || syscallno == SYS_fork || syscallno == SYS_vfork
}

pub fn is_execve(syscallno: i64) -> bool {
    syscallno == SYS_execve
}

pub fn is_exit_family(syscallno: i64) -> bool {
    syscallno == SYS_exit || syscallno == SYS_exit_group
}

pub fn syscall_name(syscallno: i64) -> &'static str {
    crate::syscall_policy::syscall_name(syscallno)
}
