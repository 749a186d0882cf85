//! Tracee register snapshot.
//!
//! The teacher supports both x86 and x64 tracees behind a `RegistersUnion`
//! and a pair of `rd_get_reg!`/`rd_set_reg!` macros that pick the active
//! arch member. Cross-architecture replay is an explicit Non-goal here
//! (spec.md §1, §9), so this is a straight wrapper around the host's
//! native `libc::user_regs_struct` with no arch union.

use libc::user_regs_struct;
use static_assertions::const_assert_eq;

const_assert_eq!(std::mem::size_of::<user_regs_struct>(), 27 * 8);

#[derive(Copy, Clone, Debug)]
pub struct Registers {
    regs: user_regs_struct,
}

impl Registers {
    pub fn from_raw(regs: user_regs_struct) -> Registers {
        Registers { regs }
    }

    pub fn raw(&self) -> user_regs_struct {
        self.regs
    }

    pub fn raw_mut(&mut self) -> &mut user_regs_struct {
        &mut self.regs
    }

    pub fn ip(&self) -> u64 {
        self.regs.rip
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.regs.rip = ip;
    }

    pub fn sp(&self) -> u64 {
        self.regs.rsp
    }

    /// The syscall number as seen at entry (`orig_rax`, which the kernel
    /// leaves untouched across the syscall so it's recoverable at exit too).
    pub fn original_syscallno(&self) -> i64 {
        self.regs.orig_rax as i64
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        self.regs.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> u64 {
        self.regs.rax
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.regs.rax as i64
    }

    pub fn set_syscall_result(&mut self, result: u64) {
        self.regs.rax = result;
    }

    pub fn arg1(&self) -> u64 {
        self.regs.rdi
    }
    pub fn arg2(&self) -> u64 {
        self.regs.rsi
    }
    pub fn arg3(&self) -> u64 {
        self.regs.rdx
    }
    pub fn arg4(&self) -> u64 {
        self.regs.r10
    }
    pub fn arg5(&self) -> u64 {
        self.regs.r8
    }
    pub fn arg6(&self) -> u64 {
        self.regs.r9
    }

    pub fn set_arg1(&mut self, v: u64) {
        self.regs.rdi = v;
    }
    pub fn set_arg2(&mut self, v: u64) {
        self.regs.rsi = v;
    }

    /// Rewind the instruction pointer back over the two-byte `syscall`
    /// instruction, the move the replayer makes before skipping a syscall
    /// it intends to emulate rather than re-execute (spec.md §4.7).
    pub fn decrement_ip_by_syscall_insn_length(&mut self) {
        self.regs.rip -= 2;
    }

}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            regs: unsafe { std::mem::zeroed() },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_ip_is_reflected_in_raw_rip() {
        let mut r = Registers::default();
        r.set_ip(0x1000);
        assert_eq!(r.ip(), 0x1000);
        assert_eq!(r.raw().rip, 0x1000);
    }

    #[test]
    fn decrement_ip_by_syscall_insn_length_rewinds_two_bytes() {
        let mut r = Registers::default();
        r.set_ip(0x2000);
        r.decrement_ip_by_syscall_insn_length();
        assert_eq!(r.ip(), 0x1ffe);
    }
}
