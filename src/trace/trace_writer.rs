//! Single-writer append encoder for the events file.
//!
//! Each record is framed as `[u32 LE length][JSON payload][0xAA commit
//! byte]`. The commit byte is what makes "a record is either fully
//! committed or absent" (spec.md §4.3) checkable on next open: a crash
//! mid-write leaves either a short length prefix, a short payload, or a
//! missing commit byte, all of which the reader's truncation pass detects
//! and discards. JSON (via `serde_json`, already in the dependency stack
//! for the trace-info command) is used for the payload instead of a
//! bespoke binary layout per field — the framing is what's binary and
//! length-prefixed, as spec.md requires; see DESIGN.md.

use crate::error::RdResult;
use crate::event::EventRecord;
use crate::trace::trace_stream::{TraceDir, TraceHeader};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

const COMMIT_BYTE: u8 = 0xAA;

pub struct TraceWriter {
    dir: TraceDir,
    header_file: File,
    events_file: File,
    header: TraceHeader,
    next_seq: u64,
    /// Per-tid offsets of each event belonging to that tid, flushed into
    /// the header's sub-index region at `close()`.
    per_tid_offsets: std::collections::HashMap<u32, Vec<u64>>,
}

impl TraceWriter {
    pub fn create(dir: TraceDir) -> RdResult<TraceWriter> {
        dir.create()?;
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let header = TraceHeader::new_for_recording(start);
        let mut header_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.header())?;
        header_file.write_all(&header.to_bytes())?;
        header_file.sync_all()?;
        let events_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.events())?;
        Ok(TraceWriter {
            dir,
            header_file,
            events_file,
            header,
            next_seq: 0,
            per_tid_offsets: Default::default(),
        })
    }

    /// Appends one event record, assigning it the next dense ascending
    /// sequence number (spec.md §3 invariant 1). Returns the sequence
    /// number assigned, since callers (e.g. the `--dump_memory=<n>`
    /// diagnostic) key off it.
    pub fn write_event(&mut self, mut record: EventRecord) -> RdResult<u64> {
        record.seq = self.next_seq;
        self.next_seq += 1;

        let offset = self.events_file.stream_position()?;
        self.per_tid_offsets
            .entry(record.logical_tid)
            .or_default()
            .push(offset);

        let payload = serde_json::to_vec(&record)
            .map_err(|e| crate::error::RdError::TraceFormat(e.to_string()))?;
        let mut framed = Vec::with_capacity(4 + payload.len() + 1);
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        framed.push(COMMIT_BYTE);
        self.events_file.write_all(&framed)?;
        Ok(record.seq)
    }

    pub fn dir(&self) -> &TraceDir {
        &self.dir
    }

    /// Flushes the events file and rewrites the sub-index pointer into
    /// the header, finalizing it as spec.md §4.3 describes. Called once,
    /// at session close.
    pub fn close(mut self) -> RdResult<()> {
        self.events_file.sync_all()?;
        let sub_index_offset = self.events_file.stream_position()?;
        let index_bytes = serde_json::to_vec(&self.per_tid_offsets)
            .map_err(|e| crate::error::RdError::TraceFormat(e.to_string()))?;
        self.events_file.write_all(&index_bytes)?;
        self.events_file.sync_all()?;

        self.header.sub_index_offset = sub_index_offset;
        self.header.sub_index_valid = true;
        self.header_file.seek(SeekFrom::Start(0))?;
        self.header_file.write_all(&self.header.to_bytes())?;
        self.header_file.sync_all()?;
        Ok(())
    }
}
