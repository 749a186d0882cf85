//! The syscall policy table: spec.md's "design's hinge" (§9), expressed
//! as data rather than a switch buried in the recorder/replayer main
//! loops, so it can be audited and exhaustively tested.
//!
//! Every syscall the target programs may issue is classified as one of:
//! - **Transparent** — only the result register matters; no kernel
//!   memory writes to capture.
//! - **BufferWriting** — the kernel also writes into one or more output
//!   buffers described by specific argument registers; those bytes are
//!   captured on `SYSCALL_EXIT` and replayed by writing them back without
//!   calling the kernel.
//! - **ReExecute** — side-effecting on kernel state that will re-manifest
//!   identically on replay (pure address-space management), so the
//!   replayer lets the tracee perform it natively instead of synthesizing
//!   a result.

use libc::{
    SYS_access, SYS_arch_prctl, SYS_brk, SYS_clock_gettime, SYS_clone, SYS_close, SYS_execve,
    SYS_exit, SYS_exit_group, SYS_fork, SYS_fstat, SYS_futex, SYS_getpid, SYS_gettid,
    SYS_gettimeofday, SYS_ioctl, SYS_kill, SYS_lstat, SYS_mmap, SYS_mprotect, SYS_munmap,
    SYS_nanosleep, SYS_open, SYS_openat, SYS_pipe, SYS_pipe2, SYS_read, SYS_readlink,
    SYS_rt_sigaction, SYS_rt_sigprocmask, SYS_set_robust_list, SYS_stat, SYS_tgkill, SYS_uname,
    SYS_vfork, SYS_wait4, SYS_write,
};

/// Where a captured/replayed output buffer's length comes from.
#[derive(Copy, Clone, Debug)]
pub enum LengthSource {
    /// A compile-time-known struct size (e.g. `struct stat`).
    Fixed(usize),
    /// The length is itself an argument register (e.g. `read(fd, buf, count)`).
    ArgRegister(u8),
    /// The length is the syscall's own (non-negative) return value (e.g.
    /// the actual bytes `read()` delivered, which may be less than asked).
    ReturnValue,
}

/// One kernel-written output buffer, located by which argument register
/// holds its address.
#[derive(Copy, Clone, Debug)]
pub struct OutputBuffer {
    pub ptr_arg: u8,
    pub length: LengthSource,
}

const fn buf(ptr_arg: u8, length: LengthSource) -> OutputBuffer {
    OutputBuffer { ptr_arg, length }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallPolicyKind {
    Transparent,
    BufferWriting,
    ReExecute,
}

#[derive(Copy, Clone, Debug)]
pub enum SyscallPolicy {
    Transparent,
    BufferWriting(&'static [OutputBuffer]),
    ReExecute,
}

impl SyscallPolicy {
    pub fn kind(&self) -> SyscallPolicyKind {
        match self {
            SyscallPolicy::Transparent => SyscallPolicyKind::Transparent,
            SyscallPolicy::BufferWriting(_) => SyscallPolicyKind::BufferWriting,
            SyscallPolicy::ReExecute => SyscallPolicyKind::ReExecute,
        }
    }
}

const STAT_SIZE: usize = std::mem::size_of::<libc::stat>();
const TIMEVAL_PAIR_SIZE: usize = std::mem::size_of::<libc::timeval>() * 2 + 8;
const TIMESPEC_SIZE: usize = std::mem::size_of::<libc::timespec>();
const UTSNAME_SIZE: usize = std::mem::size_of::<libc::utsname>();

static READ_BUFS: &[OutputBuffer] = &[buf(1, LengthSource::ReturnValue)];
static STAT_BUFS: &[OutputBuffer] = &[buf(1, LengthSource::Fixed(STAT_SIZE))];
static FSTAT_BUFS: &[OutputBuffer] = &[buf(1, LengthSource::Fixed(STAT_SIZE))];
static GETTIMEOFDAY_BUFS: &[OutputBuffer] = &[buf(0, LengthSource::Fixed(TIMEVAL_PAIR_SIZE))];
static CLOCK_GETTIME_BUFS: &[OutputBuffer] = &[buf(1, LengthSource::Fixed(TIMESPEC_SIZE))];
static PIPE_BUFS: &[OutputBuffer] = &[buf(0, LengthSource::Fixed(8))];
static READLINK_BUFS: &[OutputBuffer] = &[buf(1, LengthSource::ReturnValue)];
static UNAME_BUFS: &[OutputBuffer] = &[buf(0, LengthSource::Fixed(UTSNAME_SIZE))];
static IOCTL_BUFS: &[OutputBuffer] = &[buf(2, LengthSource::ArgRegister(3))];

/// Look up the policy for a syscall number. Unrecognised syscall numbers
/// fall back to `Transparent` with a logged warning rather than a panic:
/// an unaudited syscall is a correctness risk for the *next* trace, not a
/// reason to crash the current recording outright, but the fallback must
/// be visible so the table can be extended (spec.md §9: exhaustive per
/// target program, not per a priori guess).
pub fn policy_for(syscallno: i64) -> SyscallPolicy {
    match syscallno {
        n if n == SYS_read => SyscallPolicy::BufferWriting(READ_BUFS),
        n if n == SYS_write => SyscallPolicy::Transparent,
        n if n == SYS_open || n == SYS_openat || n == SYS_close => SyscallPolicy::Transparent,
        n if n == SYS_stat || n == SYS_lstat => SyscallPolicy::BufferWriting(STAT_BUFS),
        n if n == SYS_fstat => SyscallPolicy::BufferWriting(FSTAT_BUFS),
        n if n == SYS_gettimeofday => SyscallPolicy::BufferWriting(GETTIMEOFDAY_BUFS),
        n if n == SYS_clock_gettime => SyscallPolicy::BufferWriting(CLOCK_GETTIME_BUFS),
        n if n == SYS_pipe || n == SYS_pipe2 => SyscallPolicy::BufferWriting(PIPE_BUFS),
        n if n == SYS_readlink => SyscallPolicy::BufferWriting(READLINK_BUFS),
        n if n == SYS_uname => SyscallPolicy::BufferWriting(UNAME_BUFS),
        n if n == SYS_ioctl => SyscallPolicy::BufferWriting(IOCTL_BUFS),
        n if n == SYS_access
            || n == SYS_exit
            || n == SYS_exit_group
            || n == SYS_kill
            || n == SYS_tgkill
            || n == SYS_rt_sigaction
            || n == SYS_rt_sigprocmask
            || n == SYS_nanosleep
            || n == SYS_getpid
            || n == SYS_gettid
            || n == SYS_wait4
            || n == SYS_execve
            || n == SYS_clone
            || n == SYS_fork
            || n == SYS_vfork
            || n == SYS_futex
            || n == SYS_set_robust_list =>
        {
            SyscallPolicy::Transparent
        }
        n if n == SYS_brk || n == SYS_mmap || n == SYS_munmap || n == SYS_mprotect || n == SYS_arch_prctl => {
            SyscallPolicy::ReExecute
        }
        other => {
            log!(
                LogWarn,
                "no syscall policy entry for syscall {}, defaulting to Transparent",
                other
            );
            SyscallPolicy::Transparent
        }
    }
}

pub fn syscall_name(syscallno: i64) -> &'static str {
    match syscallno {
        n if n == SYS_read => "read",
        n if n == SYS_write => "write",
        n if n == SYS_open => "open",
        n if n == SYS_openat => "openat",
        n if n == SYS_close => "close",
        n if n == SYS_stat => "stat",
        n if n == SYS_fstat => "fstat",
        n if n == SYS_lstat => "lstat",
        n if n == SYS_gettimeofday => "gettimeofday",
        n if n == SYS_clock_gettime => "clock_gettime",
        n if n == SYS_pipe => "pipe",
        n if n == SYS_pipe2 => "pipe2",
        n if n == SYS_readlink => "readlink",
        n if n == SYS_uname => "uname",
        n if n == SYS_ioctl => "ioctl",
        n if n == SYS_access => "access",
        n if n == SYS_exit => "exit",
        n if n == SYS_exit_group => "exit_group",
        n if n == SYS_kill => "kill",
        n if n == SYS_tgkill => "tgkill",
        n if n == SYS_rt_sigaction => "rt_sigaction",
        n if n == SYS_rt_sigprocmask => "rt_sigprocmask",
        n if n == SYS_nanosleep => "nanosleep",
        n if n == SYS_getpid => "getpid",
        n if n == SYS_gettid => "gettid",
        n if n == SYS_wait4 => "wait4",
        n if n == SYS_execve => "execve",
        n if n == SYS_clone => "clone",
        n if n == SYS_fork => "fork",
        n if n == SYS_vfork => "vfork",
        n if n == SYS_futex => "futex",
        n if n == SYS_set_robust_list => "set_robust_list",
        n if n == SYS_brk => "brk",
        n if n == SYS_mmap => "mmap",
        n if n == SYS_munmap => "munmap",
        n if n == SYS_mprotect => "mprotect",
        n if n == SYS_arch_prctl => "arch_prctl",
        _ => "<unknown>",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_is_buffer_writing_with_return_value_length() {
        match policy_for(SYS_read) {
            SyscallPolicy::BufferWriting(bufs) => {
                assert_eq!(bufs.len(), 1);
                assert_eq!(bufs[0].ptr_arg, 1);
                assert!(matches!(bufs[0].length, LengthSource::ReturnValue));
            }
            _ => panic!("read should be BufferWriting"),
        }
    }

    #[test]
    fn mmap_family_is_re_executed() {
        for sys in [SYS_mmap, SYS_munmap, SYS_brk, SYS_mprotect] {
            assert_eq!(policy_for(sys).kind(), SyscallPolicyKind::ReExecute);
        }
    }

    #[test]
    fn clone_family_is_transparent_so_the_recorder_captures_only_registers() {
        for sys in [SYS_clone, SYS_fork, SYS_vfork] {
            assert_eq!(policy_for(sys).kind(), SyscallPolicyKind::Transparent);
        }
    }

    #[test]
    fn unknown_syscall_falls_back_without_panicking() {
        assert_eq!(policy_for(999_999).kind(), SyscallPolicyKind::Transparent);
    }
}
