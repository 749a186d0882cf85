//! `rd trace-info <dir>`: prints a trace's header and per-tid event
//! counts as JSON, without replaying it (spec.md §12). Adapted from the
//! teacher's `TraceInfoCommand`, which replayed up to the first `exec` to
//! report captured CPU/environment metadata; this core's header already
//! carries everything informational (arch tag, page size, start wall-
//! clock), so no replay is needed to answer "what's in this trace".

use crate::error::RdResult;
use crate::trace::{TraceDir, TraceReader};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfoReport {
    format_version: u32,
    arch_tag: String,
    page_size: u32,
    start_wall_clock: u64,
    event_count: u64,
    events_per_tid: HashMap<u32, u64>,
}

pub fn run(trace_dir: &Path) -> RdResult<()> {
    let mut reader = TraceReader::open(TraceDir::new(trace_dir))?;
    let header = reader.header().clone();

    let mut event_count = 0u64;
    let mut events_per_tid: HashMap<u32, u64> = HashMap::new();
    while let Some(event) = reader.read_event()? {
        event_count += 1;
        *events_per_tid.entry(event.logical_tid).or_insert(0) += 1;
    }

    let report = TraceInfoReport {
        format_version: header.version,
        arch_tag: header.arch_tag,
        page_size: header.page_size,
        start_wall_clock: header.start_wall_clock,
        event_count,
        events_per_tid,
    };
    let serialized =
        serde_json::to_string_pretty(&report).expect("TraceInfoReport is always serializable");
    println!("{}", serialized);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{EventPayload, EventRecord, ExitEvent, RegisterSnapshot};
    use crate::trace::TraceWriter;
    use std::path::PathBuf;

    fn tmp_dir(name: &str) -> TraceDir {
        let mut p = PathBuf::from(std::env::temp_dir());
        p.push(format!("revtrace-traceinfo-test-{}-{}", name, std::process::id()));
        TraceDir::new(p)
    }

    #[test]
    fn reports_event_count_per_tid() {
        let dir = tmp_dir("basic");
        let mut w = TraceWriter::create(dir.clone()).unwrap();
        for tid in [1u32, 1, 2] {
            w.write_event(EventRecord {
                seq: 0,
                logical_tid: tid,
                ticks_since_prev: 0,
                regs: RegisterSnapshot::default(),
                payload: EventPayload::Exit(ExitEvent { status: 0 }),
            })
            .unwrap();
        }
        w.close().unwrap();

        run(dir.root()).unwrap();
    }
}
