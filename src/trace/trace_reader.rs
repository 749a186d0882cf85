//! Positional streaming reader over the events file, with the
//! truncate-to-last-complete-record recovery spec.md §4.3 and §8 S5
//! require.
//!
//! Recovery is computed once, at `open()`, by scanning record frames
//! without mutating the file — `open()` followed immediately by `close()`
//! (dropping the reader) must leave the trace byte-for-byte unchanged
//! (spec.md §8 property 6), so "truncate" here means "stop handing out
//! records past this offset", not "rewrite the file".

use crate::error::{RdError, RdResult};
use crate::event::EventRecord;
use crate::trace::trace_stream::{TraceDir, TraceHeader, HEADER_LEN};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

const COMMIT_BYTE: u8 = 0xAA;

#[derive(Debug)]
pub struct TraceReader {
    dir: TraceDir,
    header: TraceHeader,
    reader: BufReader<File>,
    /// Byte offset in the events file past which no record is known-good.
    valid_end: u64,
    bytes_consumed: u64,
}

impl TraceReader {
    pub fn open(dir: TraceDir) -> RdResult<TraceReader> {
        let header_bytes = std::fs::read(dir.header())?;
        if header_bytes.len() < HEADER_LEN {
            return Err(RdError::TraceFormat("truncated trace header".into()));
        }
        let header = TraceHeader::from_bytes(&header_bytes)?;

        let valid_end = Self::scan_valid_end(&dir.events())?;
        let events_file = File::open(dir.events())?;
        Ok(TraceReader {
            dir,
            header,
            reader: BufReader::new(events_file),
            valid_end,
            bytes_consumed: 0,
        })
    }

    fn scan_valid_end(path: &std::path::Path) -> RdResult<u64> {
        let mut f = File::open(path)?;
        let mut offset = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            if f.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            if f.read_exact(&mut payload).is_err() {
                break;
            }
            let mut commit = [0u8; 1];
            if f.read_exact(&mut commit).is_err() || commit[0] != COMMIT_BYTE {
                break;
            }
            offset += 4 + len as u64 + 1;
        }
        Ok(offset)
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn dir(&self) -> &TraceDir {
        &self.dir
    }

    /// Reads the next event in the stream, or `None` once the stream is
    /// exhausted (either genuinely, or because a trailing partial record
    /// was discarded by the truncation pass).
    pub fn read_event(&mut self) -> RdResult<Option<EventRecord>> {
        if self.bytes_consumed >= self.valid_end {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        let mut commit = [0u8; 1];
        self.reader.read_exact(&mut commit)?;
        self.bytes_consumed += 4 + len as u64 + 1;

        let record: EventRecord = serde_json::from_slice(&payload)
            .map_err(|e| RdError::TraceFormat(format!("corrupt event record: {}", e)))?;
        Ok(Some(record))
    }

    /// Loads the per-tid offset index written at recording close, if the
    /// trace closed cleanly. Not needed for ordinary sequential replay;
    /// used by diagnostic tooling that wants to jump to a tid's events.
    pub fn per_tid_index(&self) -> RdResult<HashMap<u32, Vec<u64>>> {
        if !self.header.sub_index_valid {
            return Ok(HashMap::new());
        }
        let mut f = File::open(self.dir.events())?;
        f.seek(SeekFrom::Start(self.header.sub_index_offset))?;
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes)?;
        serde_json::from_slice(&bytes).map_err(|e| RdError::TraceFormat(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{EventPayload, EventRecord, RegisterSnapshot};
    use crate::trace::trace_writer::TraceWriter;
    use std::path::PathBuf;

    fn tmp_dir(name: &str) -> TraceDir {
        let mut p = PathBuf::from(std::env::temp_dir());
        p.push(format!("revtrace-test-{}-{}", name, std::process::id()));
        TraceDir::new(p)
    }

    fn sample_record(seq: u64, tid: u32) -> EventRecord {
        EventRecord {
            seq,
            logical_tid: tid,
            ticks_since_prev: 42,
            regs: RegisterSnapshot::default(),
            payload: EventPayload::Sched,
        }
    }

    #[test]
    fn round_trips_events_in_order() {
        let dir = tmp_dir("roundtrip");
        let mut w = TraceWriter::create(dir.clone()).unwrap();
        for i in 0..5u64 {
            w.write_event(sample_record(999, 0)).unwrap();
            let _ = i;
        }
        w.close().unwrap();

        let mut r = TraceReader::open(dir).unwrap();
        let mut seqs = Vec::new();
        while let Some(ev) = r.read_event().unwrap() {
            seqs.push(ev.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn truncated_trailing_record_is_dropped_without_error() {
        let dir = tmp_dir("truncate");
        let mut w = TraceWriter::create(dir.clone()).unwrap();
        w.write_event(sample_record(0, 0)).unwrap();
        w.write_event(sample_record(0, 0)).unwrap();
        w.close().unwrap();

        // Corrupt the trailing commit byte of the last record, simulating
        // a crash mid-append (spec.md §8 S5).
        let events_path = dir.events();
        let mut bytes = std::fs::read(&events_path).unwrap();
        *bytes.last_mut().unwrap() = 0x00;
        // Also chop a byte off to simulate a short write.
        bytes.pop();
        std::fs::write(&events_path, &bytes).unwrap();

        let mut r = TraceReader::open(dir).unwrap();
        let mut count = 0;
        while r.read_event().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "only the first, intact record should replay");
    }

    #[test]
    fn wrong_arch_tag_fails_at_open_not_at_first_event() {
        let dir = tmp_dir("archmismatch");
        let w = TraceWriter::create(dir.clone()).unwrap();
        w.close().unwrap();

        let mut header = std::fs::read(dir.header()).unwrap();
        // Stomp the arch tag bytes (offset 12, length 32 per to_bytes layout).
        for b in header[12..12 + 32].iter_mut() {
            *b = 0;
        }
        header[12..12 + 5].copy_from_slice(b"mips\0");
        std::fs::write(dir.header(), &header).unwrap();

        let err = TraceReader::open(dir).unwrap_err();
        assert!(matches!(err, RdError::TraceFormat(_)));
    }
}
