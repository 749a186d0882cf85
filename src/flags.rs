//! Session-wide configuration, built once by the driver and passed
//! explicitly to the recorder/replayer engines.
//!
//! The teacher kept this as a `lazy_static` global (`Flags::get()`); per
//! the design note about the global tracee registry being "a symptom, not
//! a requirement" (see DESIGN.md), this version is a plain struct
//! constructed in `main` and threaded through by reference instead.

/// When to checksum tracee memory, trading overhead for earlier detection
/// of a corrupted replay.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Checksum {
    ChecksumNone,
    ChecksumSyscall,
    ChecksumAll,
}

#[derive(Clone, Debug)]
pub struct Flags {
    pub checksum: Checksum,
    /// Redirect tracee stdout/stderr into files inside the trace directory.
    pub redirect_output: bool,
    /// Global event sequence number at which to dump the tracee's memory
    /// map to disk, or `None` if memory dumping is disabled. See DESIGN.md
    /// for why this indexes the global event stream rather than a per-tid
    /// one.
    pub dump_memory_at_event: Option<u64>,
    /// Branch count handed to a tracee per scheduling quantum.
    pub slice_branches: u64,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            checksum: Checksum::ChecksumNone,
            redirect_output: false,
            dump_memory_at_event: None,
            slice_branches: 10_000,
        }
    }
}
