//! Decodes the raw status word `waitpid(2)` hands back, including the
//! ptrace-event byte the kernel packs into bits 16-23 when the stop was
//! caused by `PTRACE_O_TRACESYSGOOD`/`PTRACE_O_TRACECLONE`-class options
//! rather than a plain signal-delivery-stop.

use libc::{PTRACE_EVENT_CLONE, PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, PTRACE_EVENT_FORK, PTRACE_EVENT_VFORK};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitStatus {
    raw: i32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopKind {
    /// Stopped at syscall entry or exit, distinguished by the caller
    /// tracking parity (spec.md §4.1): a `SIGTRAP | 0x80` stop from
    /// `PTRACE_O_TRACESYSGOOD`.
    SyscallStop,
    /// A `PTRACE_EVENT_*` stop: clone/fork/vfork/exec/exit.
    PtraceEvent(i32),
    /// An ordinary signal-delivery-stop.
    SignalStop(i32),
    /// Group-stop (job control), distinguishable from signal-delivery-stop
    /// by `PTRACE_GETSIGINFO` failing with `-EINVAL` in the real kernel;
    /// approximated here via the synthetic stop signal value.
    GroupStop(i32),
}

impl WaitStatus {
    pub fn new(raw: i32) -> WaitStatus {
        WaitStatus { raw }
    }

    pub fn raw(&self) -> i32 {
        self.raw
    }

    pub fn exited(&self) -> bool {
        libc::WIFEXITED(self.raw)
    }

    pub fn exit_status(&self) -> i32 {
        libc::WEXITSTATUS(self.raw)
    }

    pub fn signaled(&self) -> bool {
        libc::WIFSIGNALED(self.raw)
    }

    pub fn term_sig(&self) -> i32 {
        libc::WTERMSIG(self.raw)
    }

    pub fn stopped(&self) -> bool {
        libc::WIFSTOPPED(self.raw)
    }

    pub fn stop_sig(&self) -> i32 {
        libc::WSTOPSIG(self.raw)
    }

    /// The `PTRACE_EVENT_*` code, or 0 if this stop wasn't a ptrace event.
    /// The kernel packs status as `((SIGTRAP | event << 8) << 8) | 0x7f`,
    /// so the event code lives in bits 16-23.
    pub fn ptrace_event(&self) -> i32 {
        (self.raw >> 16) & 0xff
    }

    pub fn is_clone_event(&self) -> bool {
        matches!(
            self.ptrace_event(),
            e if e == PTRACE_EVENT_CLONE || e == PTRACE_EVENT_FORK || e == PTRACE_EVENT_VFORK
        )
    }

    pub fn is_exec_event(&self) -> bool {
        self.ptrace_event() == PTRACE_EVENT_EXEC
    }

    pub fn is_exit_event(&self) -> bool {
        self.ptrace_event() == PTRACE_EVENT_EXIT
    }

    pub fn classify(&self) -> StopKind {
        if !self.stopped() {
            // Caller should have checked exited()/signaled() first.
            return StopKind::SignalStop(self.stop_sig());
        }
        let event = self.ptrace_event();
        if event != 0 {
            return StopKind::PtraceEvent(event);
        }
        // SIGTRAP with the high bit set (0x80) is the syscall-stop marker
        // we arm with PTRACE_O_TRACESYSGOOD.
        if self.stop_sig() == (libc::SIGTRAP | 0x80) {
            return StopKind::SyscallStop;
        }
        StopKind::SignalStop(self.stop_sig())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_stopped(sig: i32) -> WaitStatus {
        // Mirrors glibc's WIFSTOPPED/WSTOPSIG encoding: low byte 0x7f, next
        // byte the stop signal.
        WaitStatus::new((sig << 8) | 0x7f)
    }

    #[test]
    fn syscall_stop_is_classified() {
        let ws = make_stopped(libc::SIGTRAP | 0x80);
        assert_eq!(ws.classify(), StopKind::SyscallStop);
    }

    #[test]
    fn plain_signal_stop_is_classified() {
        let ws = make_stopped(libc::SIGUSR1);
        assert_eq!(ws.classify(), StopKind::SignalStop(libc::SIGUSR1));
    }

    #[test]
    fn ptrace_clone_event_is_distinguished_from_signal_stop() {
        let raw = ((libc::SIGTRAP | (PTRACE_EVENT_CLONE << 8)) << 8) | 0x7f;
        let ws = WaitStatus::new(raw);
        assert!(ws.is_clone_event());
    }
}
