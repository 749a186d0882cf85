//! The HPC driver (spec.md §4.2): per-tracee handles on a hardware
//! performance counter counting retired conditional branches, the
//! alignment signal the replayer rendezvous depends on.
//!
//! There's no high-level `perf-event` crate dependency here because the
//! event this core needs — retired *conditional* branches, not all
//! branches — isn't exposed as a `PERF_TYPE_HARDWARE` generic event on
//! most CPUs; it has to be armed as a vendor-specific raw PMU event, the
//! same way `rr` does it and the way the pack's raw perf_event_open
//! wrappers do it (see `a670c098_gz-rust-perfcnt` and
//! `bde8f317_Thaumy-perf-event-open`): build a `perf_event_attr` by hand
//! and issue `perf_event_open` directly via `libc::syscall`. Host vendor
//! detection to pick the right raw event code comes from the `raw-cpuid`
//! crate the teacher already depends on.

use crate::error::{RdError, RdResult};
use crate::ticks::Ticks;
use libc::{c_int, c_long, pid_t};
use std::os::unix::io::RawFd;

const PERF_TYPE_RAW: u32 = 4;
const PERF_EVENT_IOC_RESET: u64 = 0x2403;
const PERF_EVENT_IOC_REFRESH: u64 = 0x2402;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;

/// Not exposed by the `libc` crate for this target; value per `fcntl(2)`.
const F_SETSIG: c_int = 10;

/// Intel: `BR_INST_RETIRED.CONDITIONAL` (event 0xc4, umask 0x01).
const RAW_EVENT_INTEL_COND_BRANCH: u64 = 0x5101c4;
/// AMD: `RETIRED_BRANCH_INSTR.CONDITIONAL` approximation via the
/// retired-taken-branches event family (event 0xc2) with unit mask 0x00;
/// exact encoding is family-dependent, matching the teacher's own
/// per-vendor caveats around branch counter precision (spec.md §9).
const RAW_EVENT_AMD_COND_BRANCH: u64 = 0x5100c2;

#[repr(C)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const FLAG_EXCLUDE_HV: u64 = 1 << 6;
const FLAG_PINNED: u64 = 1 << 2;

fn raw_conditional_branch_config() -> u64 {
    let cpuid = raw_cpuid::CpuId::new();
    match cpuid.get_vendor_info().map(|v| v.as_string().to_string()) {
        Some(ref v) if v == "AuthenticAMD" => RAW_EVENT_AMD_COND_BRANCH,
        _ => RAW_EVENT_INTEL_COND_BRANCH,
    }
}

fn perf_event_open(attr: &PerfEventAttr, pid: pid_t, cpu: c_int, group_fd: c_int, flags: c_long) -> RawFd {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        ) as RawFd
    }
}

/// A per-thread handle on the retired-conditional-branch counter.
pub struct PerfCounters {
    fd: RawFd,
    tid: pid_t,
    /// Ticks recorded as of the last `reset()`, so `read()` reports a
    /// delta even though the underlying counter is monotonic.
    baseline: u64,
}

impl PerfCounters {
    /// Opens and arms (but does not start) a counter for `tid`. Per
    /// spec.md §4.2, failure here (insufficient privilege, unsupported
    /// CPU) is fatal at session start, not recoverable per-tracee.
    pub fn open(tid: pid_t) -> RdResult<PerfCounters> {
        let attr = PerfEventAttr {
            type_: PERF_TYPE_RAW,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: raw_conditional_branch_config(),
            sample_period: 0,
            sample_type: 0,
            read_format: 0,
            flags: FLAG_DISABLED | FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV | FLAG_PINNED,
            wakeup_events: 0,
            bp_type: 0,
            config1: 0,
            config2: 0,
            branch_sample_type: 0,
            sample_regs_user: 0,
            sample_stack_user: 0,
            clockid: 0,
            sample_regs_intr: 0,
            aux_watermark: 0,
            sample_max_stack: 0,
            reserved_2: 0,
        };
        let fd = perf_event_open(&attr, tid, -1, -1, 0);
        if fd < 0 {
            return Err(RdError::Prerequisite(format!(
                "perf_event_open failed for tid {}: {}",
                tid,
                std::io::Error::last_os_error()
            )));
        }
        // Route the overflow notification to this tracee as SIGTRAP
        // rather than the default SIGIO, so wait_status's branch-budget
        // classification (a SIGTRAP signal-stop with no ptrace-event code)
        // sees it as the same stop kind a single-step would produce.
        unsafe {
            if libc::fcntl(fd, libc::F_SETOWN, tid) < 0
                || libc::fcntl(fd, F_SETSIG, libc::SIGTRAP) < 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(RdError::Prerequisite(format!(
                    "failed to route perf overflow signal for tid {}: {}",
                    tid, err
                )));
            }
            let cur_flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, cur_flags | libc::O_ASYNC);
        }
        Ok(PerfCounters {
            fd,
            tid,
            baseline: 0,
        })
    }

    fn ioctl(&self, request: u64, arg: c_long) -> RdResult<()> {
        let ret = unsafe { libc::ioctl(self.fd, request as _, arg) };
        if ret < 0 {
            return Err(RdError::TransientOs("perf ioctl", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Clears the counter to zero. The controller calls this whenever the
    /// tracee transitions into `Running`, so counts attribute only to
    /// user execution (spec.md §4.1(a)).
    pub fn reset(&mut self) -> RdResult<()> {
        self.ioctl(PERF_EVENT_IOC_RESET, 0)?;
        self.baseline = 0;
        Ok(())
    }

    pub fn start(&self) -> RdResult<()> {
        self.ioctl(PERF_EVENT_IOC_ENABLE, 0)
    }

    /// Pauses counting. Called whenever the tracee is stopped, mirroring
    /// the pause/restore-on-switch guarantee of spec.md §4.1(b).
    pub fn stop(&self) -> RdResult<()> {
        self.ioctl(PERF_EVENT_IOC_DISABLE, 0)
    }

    /// Reads the raw (monotonic since last reset) retired-conditional-
    /// branch count.
    pub fn read(&self) -> RdResult<Ticks> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(RdError::TransientOs("perf read", std::io::Error::last_os_error()));
        }
        Ok(value)
    }

    /// Arms the counter to deliver `SIGIO` to this thread after exactly
    /// `n` more retired conditional branches, via the classic
    /// `PERF_EVENT_IOC_REFRESH` one-shot-overflow idiom (the same
    /// mechanism `rr` uses; see also the raw perf_event_open examples in
    /// this pack for the surrounding `fcntl(F_SETOWN)`/`F_SETSIG` wiring
    /// that must precede this call so the overflow signal identifies the
    /// right tracee).
    pub fn arm_overflow(&mut self, n: Ticks) -> RdResult<()> {
        self.reset()?;
        // sample_period on a counting (non-sampling) event doubles as the
        // refresh-count threshold when combined with IOC_REFRESH.
        self.ioctl(PERF_EVENT_IOC_REFRESH, n as c_long)
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vendor_raw_event_selection_is_deterministic() {
        // We can't assert a specific vendor in CI, but the function must
        // not panic and must return one of the two known encodings.
        let config = raw_conditional_branch_config();
        assert!(config == RAW_EVENT_INTEL_COND_BRANCH || config == RAW_EVENT_AMD_COND_BRANCH);
    }
}
