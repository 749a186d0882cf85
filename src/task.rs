//! The tracee controller (spec.md §4.1): ptrace wrappers, register and
//! memory I/O, and the state machine every `Task` moves through.
//!
//! Adapted from the teacher's `task_interface::task::Task`, which carried
//! the full rr/rd feature set (syscallbuf, scratch memory, checkpoint
//! cloning, 32-bit compat) behind `unimplemented!()` stubs. This core
//! only needs the subset spec.md actually specifies, implemented for
//! real: spawn, resume-to-event, register/memory I/O, and the branch-
//! budget resume the replayer's rendezvous depends on.

use crate::error::{RdError, RdResult};
use crate::perf_counters::PerfCounters;
use crate::registers::Registers;
use crate::ticks::{Ticks, TicksRequest};
use crate::wait_status::WaitStatus;
use std::convert::TryInto;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, IoVec, RemoteIoVec};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::ffi::CString;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    StoppedAtSyscallEntry,
    StoppedAtSyscallExit,
    StoppedAtSignal,
    StoppedAtClone,
    StoppedAtBranchBudget,
    Running,
    Exited,
}

/// A supervised process or thread (spec.md §3). `tid` is the logical tid
/// the core assigns; `os_pid` is the real kernel pid/tid, which can
/// differ between a recording and its replay (e.g. after an off-main-
/// thread exec changes which OS tid is the thread-group leader).
pub struct Task {
    pub logical_tid: u32,
    pub os_pid: Pid,
    pub state: TaskState,
    pub regs: Registers,
    pub hpc: PerfCounters,
    /// Set on every transition out of `Running`, the cause of that stop.
    pub last_wait_status: Option<WaitStatus>,
}

fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT
        | ptrace::Options::PTRACE_O_EXITKILL
}

impl Task {
    /// Forks and execs `exe` with `argv`/`envp` in the child, which calls
    /// `PTRACE_TRACEME` before the exec so it's stopped before its first
    /// user instruction (spec.md §4.1): "a freshly spawned tracee is
    /// stopped before its first user instruction".
    ///
    /// `redirect_output`, when given, names the `(stdout, stderr)` files
    /// the child's standard streams are `dup2`'d onto before the exec
    /// (spec.md §6 `--redirect_output`).
    pub fn spawn(
        logical_tid: u32,
        exe: &str,
        argv: &[String],
        envp: &[String],
        redirect_output: Option<(&std::path::Path, &std::path::Path)>,
    ) -> RdResult<Task> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        use nix::unistd::{dup2, execve, fork, ForkResult};

        match unsafe { fork() }? {
            ForkResult::Child => {
                ptrace::traceme().expect("PTRACE_TRACEME failed in child");
                if let Some((stdout_path, stderr_path)) = redirect_output {
                    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
                    if let Ok(fd) = open(stdout_path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC, mode) {
                        let _ = dup2(fd, libc::STDOUT_FILENO);
                    }
                    if let Ok(fd) = open(stderr_path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC, mode) {
                        let _ = dup2(fd, libc::STDERR_FILENO);
                    }
                }
                let exe_c = CString::new(exe).unwrap();
                let argv_c: Vec<CString> = argv.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();
                let envp_c: Vec<CString> = envp.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();
                let _ = execve(&exe_c, &argv_c, &envp_c);
                // execve only returns on failure.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                // Synchronize with the SIGTRAP the kernel raises on the
                // child's own exec under PTRACE_TRACEME.
                waitpid(child, None)?;
                ptrace::setoptions(child, trace_options())?;
                let hpc = PerfCounters::open(child.as_raw())?;
                let regs = ptrace::getregs(child)?;
                Ok(Task {
                    logical_tid,
                    os_pid: child,
                    state: TaskState::StoppedAtSyscallEntry,
                    regs: Registers::from_raw(regs),
                    hpc,
                    last_wait_status: None,
                })
            }
        }
    }

    /// Wraps an OS tid the kernel already created via `clone`/`fork`/
    /// `vfork` and that inherited tracing options from its parent, rather
    /// than forking one ourselves (spec.md §4.6: "assign a new logical tid
    /// to the child, register it with the scheduler"). The child is
    /// expected to already be stopped (the clone-event stop itself, or a
    /// group-stop the kernel raises for a newly traced child).
    pub fn from_existing(logical_tid: u32, os_pid: Pid) -> RdResult<Task> {
        let hpc = PerfCounters::open(os_pid.as_raw())?;
        let regs = ptrace::getregs(os_pid)?;
        Ok(Task {
            logical_tid,
            os_pid,
            state: TaskState::StoppedAtClone,
            regs: Registers::from_raw(regs),
            hpc,
            last_wait_status: None,
        })
    }

    fn sync_regs(&mut self) -> RdResult<()> {
        let raw = ptrace::getregs(self.os_pid)?;
        self.regs = Registers::from_raw(raw);
        Ok(())
    }

    fn wait_and_update(&mut self) -> RdResult<WaitStatus> {
        let status = waitpid(self.os_pid, None)?;
        self.observe_wait(status)
    }

    /// Updates this task's state and registers from a wait status the
    /// caller already collected itself, e.g. via a generic `waitpid(-1)`
    /// covering several concurrently-running tracees (spec.md §5's
    /// suspension point (a)). Shares the same decoding path as a
    /// self-issued wait so a stop is classified identically either way.
    pub fn observe_wait(&mut self, status: nix::sys::wait::WaitStatus) -> RdResult<WaitStatus> {
        let raw = wait_status_to_raw(status);
        let ws = WaitStatus::new(raw);
        self.last_wait_status = Some(ws);
        self.hpc.stop()?;
        if !ws.exited() && !(ws.signaled()) {
            self.sync_regs()?;
        }
        self.classify_state(ws);
        Ok(ws)
    }

    fn classify_state(&mut self, ws: WaitStatus) {
        use crate::wait_status::StopKind;
        self.state = if ws.exited() || ws.signaled() {
            TaskState::Exited
        } else {
            match ws.classify() {
                StopKind::SyscallStop => {
                    // Entry vs. exit is parity the recorder/replayer
                    // engines track explicitly (spec.md §4.1); the
                    // controller just reports "a syscall stop happened".
                    TaskState::StoppedAtSyscallEntry
                }
                StopKind::PtraceEvent(e) if ws.is_clone_event() => {
                    let _ = e;
                    TaskState::StoppedAtClone
                }
                StopKind::PtraceEvent(_) => TaskState::StoppedAtSyscallExit,
                StopKind::SignalStop(sig) if sig == libc::SIGTRAP => TaskState::StoppedAtBranchBudget,
                StopKind::SignalStop(_) | StopKind::GroupStop(_) => TaskState::StoppedAtSignal,
            }
        };
    }

    /// Resumes until the next syscall-entry or syscall-exit stop.
    pub fn cont_to_syscall(&mut self) -> RdResult<WaitStatus> {
        self.hpc.start()?;
        ptrace::syscall(self.os_pid, None)?;
        self.state = TaskState::Running;
        self.wait_and_update()
    }

    pub fn single_step(&mut self) -> RdResult<WaitStatus> {
        self.hpc.start()?;
        ptrace::step(self.os_pid, None)?;
        self.state = TaskState::Running;
        self.wait_and_update()
    }

    /// Arms the branch-budget overflow and resumes, per spec.md §4.1's
    /// branch-budget resume contract: the counter is paused whenever the
    /// tracee is stopped (via `hpc.stop()` in `wait_and_update`) so counts
    /// attribute only to user execution.
    ///
    /// Resumes via `PTRACE_CONT`, under which syscalls execute completely
    /// transparently (`PTRACE_O_TRACESYSGOOD` has no effect on a
    /// `PTRACE_CONT`-resumed tracee). Used by the replayer's rendezvous,
    /// which only needs to land on a branch count or a ptrace-event stop,
    /// never on a syscall-stop itself. The recorder's main loop instead
    /// uses `cont_to_syscall_with_budget` below, since it must observe
    /// every syscall entry and exit (spec.md §4.6).
    pub fn cont_to_branch_budget(&mut self, request: TicksRequest) -> RdResult<WaitStatus> {
        match request {
            TicksRequest::Unlimited => {
                self.hpc.start()?;
            }
            TicksRequest::Budget(n) => {
                self.hpc.arm_overflow(n)?;
                self.hpc.start()?;
            }
        }
        ptrace::cont(self.os_pid, None)?;
        self.state = TaskState::Running;
        self.wait_and_update()
    }

    /// Arms the branch-budget overflow like `cont_to_branch_budget`, but
    /// resumes via `PTRACE_SYSCALL` instead of `PTRACE_CONT`, so the stop
    /// this returns is whichever comes first: a syscall-entry/exit stop
    /// (tagged by `PTRACE_O_TRACESYSGOOD`), the branch-overflow signal, or
    /// a ptrace-event stop. This is the resume the recorder's main loop
    /// uses so it never misses a syscall boundary (spec.md §4.1(a), §4.6).
    pub fn cont_to_syscall_with_budget(&mut self, request: TicksRequest) -> RdResult<WaitStatus> {
        match request {
            TicksRequest::Unlimited => {
                self.hpc.start()?;
            }
            TicksRequest::Budget(n) => {
                self.hpc.arm_overflow(n)?;
                self.hpc.start()?;
            }
        }
        ptrace::syscall(self.os_pid, None)?;
        self.state = TaskState::Running;
        self.wait_and_update()
    }

    /// Resumes to the next syscall-stop without blocking the caller on the
    /// wait. Used for a tracee the record scheduler has just deprioritized
    /// for entering a syscall expected to block (spec.md §4.4), so the
    /// main loop can keep serving other runnable tracees and only collect
    /// this one's exit-stop once nothing else is runnable, via the generic
    /// OS wait primitive (spec.md §5 suspension point (a)).
    pub fn resume_nonblocking_to_syscall(&mut self) -> RdResult<()> {
        self.hpc.start()?;
        ptrace::syscall(self.os_pid, None)?;
        self.state = TaskState::Running;
        Ok(())
    }

    pub fn read_regs(&self) -> &Registers {
        &self.regs
    }

    pub fn write_regs(&mut self, regs: &Registers) -> RdResult<()> {
        ptrace::setregs(self.os_pid, regs.raw())?;
        self.regs = *regs;
        Ok(())
    }

    /// Reads `len` bytes of tracee memory at `addr` via
    /// `process_vm_readv`, falling back to `PTRACE_PEEKDATA` word-at-a-
    /// time reads if the former is unavailable (e.g. under a restrictive
    /// Yama ptrace_scope that still permits ptrace but not cross-process
    /// vm reads).
    pub fn read_mem(&self, addr: u64, len: usize) -> RdResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let local = [IoVec::from_mut_slice(&mut buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        match process_vm_readv(self.os_pid, &local, &remote) {
            Ok(n) if n == len => Ok(buf),
            _ => self.read_mem_via_peek(addr, len),
        }
    }

    fn read_mem_via_peek(&self, addr: u64, len: usize) -> RdResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        while out.len() < len {
            let word = ptrace::read(self.os_pid, cur as ptrace::AddressType)
                .map_err(RdError::Nix)?;
            let bytes = word.to_ne_bytes();
            let take = (len - out.len()).min(bytes.len());
            out.extend_from_slice(&bytes[..take]);
            cur += bytes.len() as u64;
        }
        Ok(out)
    }

    pub fn write_mem(&self, addr: u64, bytes: &[u8]) -> RdResult<()> {
        let local = [IoVec::from_slice(bytes)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: bytes.len(),
        }];
        match process_vm_writev(self.os_pid, &local, &remote) {
            Ok(n) if n == bytes.len() => Ok(()),
            _ => self.write_mem_via_poke(addr, bytes),
        }
    }

    fn write_mem_via_poke(&self, addr: u64, bytes: &[u8]) -> RdResult<()> {
        let mut cur = addr;
        let mut i = 0;
        let word_size = std::mem::size_of::<usize>();
        while i < bytes.len() {
            let remaining = bytes.len() - i;
            let word = if remaining >= word_size {
                usize::from_ne_bytes(bytes[i..i + word_size].try_into().unwrap())
            } else {
                // Preserve the tail bytes already in tracee memory.
                let mut existing = self.read_mem(cur, word_size)?;
                existing[..remaining].copy_from_slice(&bytes[i..]);
                usize::from_ne_bytes(existing.try_into().unwrap())
            };
            unsafe {
                ptrace::write(self.os_pid, cur as ptrace::AddressType, word as *mut libc::c_void)
                    .map_err(RdError::Nix)?;
            }
            cur += word_size as u64;
            i += word_size;
        }
        Ok(())
    }

    pub fn detach(&self) -> RdResult<()> {
        ptrace::detach(self.os_pid, None).map_err(RdError::Nix)
    }

    pub fn kill(&self) -> RdResult<()> {
        nix::sys::signal::kill(self.os_pid, Signal::SIGKILL).map_err(RdError::Nix)
    }

    pub fn tick_count(&self) -> RdResult<Ticks> {
        self.hpc.read()
    }
}

fn wait_status_to_raw(status: nix::sys::wait::WaitStatus) -> i32 {
    // nix's WaitStatus is already decoded; re-encode into the raw word our
    // own WaitStatus type decodes, so the rest of the core has one
    // decoding path regardless of whether a status came from nix or from
    // a raw waitpid() call elsewhere (e.g. during clone handling).
    use nix::sys::wait::WaitStatus as NixWs;
    match status {
        NixWs::Exited(_, code) => (code & 0xff) << 8,
        NixWs::Signaled(_, sig, _) => sig as i32,
        NixWs::Stopped(_, sig) => ((sig as i32) << 8) | 0x7f,
        NixWs::PtraceEvent(_, sig, event) => (((sig as i32) | (event << 8)) << 8) | 0x7f,
        NixWs::PtraceSyscall(_) => ((libc::SIGTRAP | 0x80) << 8) | 0x7f,
        NixWs::Continued(_) => 0xffff,
        NixWs::StillAlive => 0x7f7f,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_encoding_round_trips_through_wait_status_classify() {
        use nix::sys::wait::WaitStatus as NixWs;
        let raw = wait_status_to_raw(NixWs::PtraceEvent(
            Pid::from_raw(1),
            Signal::SIGTRAP,
            libc::PTRACE_EVENT_CLONE,
        ));
        let ws = WaitStatus::new(raw);
        assert!(ws.is_clone_event());
    }
}
