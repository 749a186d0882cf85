//! The trace directory layout (spec.md §6) and the fixed binary header
//! (spec.md §4.3) shared by the writer and reader.

use crate::error::{RdError, RdResult};
use crate::kernel_abi::ARCH_TAG;
use std::convert::TryInto;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"RDTRACE1";
const FORMAT_VERSION: u32 = 1;
const ARCH_TAG_LEN: usize = 32;
pub const HEADER_LEN: usize = 8 + 4 + ARCH_TAG_LEN + 4 + 8 + 8 + 1;

/// Fixed-size, little-endian trace file header (spec.md §4.3): magic,
/// format version, host architecture tag, page size, start wall-clock
/// (informational only), and the offset of the per-tid sub-index written
/// at session close.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceHeader {
    pub version: u32,
    pub arch_tag: String,
    pub page_size: u32,
    pub start_wall_clock: u64,
    pub sub_index_offset: u64,
    pub sub_index_valid: bool,
}

impl TraceHeader {
    pub fn new_for_recording(start_wall_clock: u64) -> TraceHeader {
        TraceHeader {
            version: FORMAT_VERSION,
            arch_tag: ARCH_TAG.to_string(),
            page_size: 4096,
            start_wall_clock,
            sub_index_offset: 0,
            sub_index_valid: false,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut off = 0;
        buf[off..off + 8].copy_from_slice(MAGIC);
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.version.to_le_bytes());
        off += 4;
        let tag_bytes = self.arch_tag.as_bytes();
        let n = tag_bytes.len().min(ARCH_TAG_LEN);
        buf[off..off + n].copy_from_slice(&tag_bytes[..n]);
        off += ARCH_TAG_LEN;
        buf[off..off + 4].copy_from_slice(&self.page_size.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.start_wall_clock.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.sub_index_offset.to_le_bytes());
        off += 8;
        buf[off] = self.sub_index_valid as u8;
        buf
    }

    /// Parses a header, checking magic and architecture tag. A wrong
    /// magic, version, or architecture tag is a `TraceFormat` error raised
    /// here, at trace-open time, never deferred to the first event
    /// (spec.md §7, §8 S6).
    pub fn from_bytes(buf: &[u8]) -> RdResult<TraceHeader> {
        if buf.len() < HEADER_LEN {
            return Err(RdError::TraceFormat("truncated trace header".into()));
        }
        let mut off = 0;
        if &buf[off..off + 8] != MAGIC {
            return Err(RdError::TraceFormat("bad magic".into()));
        }
        off += 8;
        let version = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        if version != FORMAT_VERSION {
            return Err(RdError::TraceFormat(format!(
                "unsupported trace format version {}",
                version
            )));
        }
        let tag_bytes = &buf[off..off + ARCH_TAG_LEN];
        let arch_tag = String::from_utf8_lossy(tag_bytes)
            .trim_end_matches('\0')
            .to_string();
        off += ARCH_TAG_LEN;
        if arch_tag != ARCH_TAG {
            return Err(RdError::TraceFormat(format!(
                "trace architecture tag '{}' does not match host '{}'",
                arch_tag, ARCH_TAG
            )));
        }
        let page_size = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let start_wall_clock = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let sub_index_offset = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let sub_index_valid = buf[off] != 0;
        Ok(TraceHeader {
            version,
            arch_tag,
            page_size,
            start_wall_clock,
            sub_index_offset,
            sub_index_valid,
        })
    }
}

/// Paths making up one trace session's directory (spec.md §6).
#[derive(Clone, Debug)]
pub struct TraceDir {
    root: PathBuf,
}

impl TraceDir {
    pub fn new(root: impl Into<PathBuf>) -> TraceDir {
        TraceDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn header(&self) -> PathBuf {
        self.root.join("header")
    }

    pub fn events(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn argv_envp(&self) -> PathBuf {
        self.root.join("argv_envp")
    }

    pub fn stdout(&self) -> PathBuf {
        self.root.join("stdout")
    }

    pub fn stderr(&self) -> PathBuf {
        self.root.join("stderr")
    }

    pub fn memory_dump(&self, event_seq: u64) -> PathBuf {
        self.root.join(format!("mem-dump-{}.bin", event_seq))
    }

    pub fn create(&self) -> RdResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = TraceHeader::new_for_recording(123);
        let bytes = h.to_bytes();
        let parsed = TraceHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn wrong_magic_is_trace_format_error() {
        let mut bytes = TraceHeader::new_for_recording(0).to_bytes();
        bytes[0] = b'X';
        let err = TraceHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RdError::TraceFormat(_)));
    }

    #[test]
    fn wrong_arch_tag_is_trace_format_error_not_deferred() {
        let mut h = TraceHeader::new_for_recording(0);
        h.arch_tag = "arm64-linux".into();
        let bytes = h.to_bytes();
        let err = TraceHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RdError::TraceFormat(_)));
    }
}
