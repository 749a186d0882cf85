//! The trace codec (spec.md §4.3) and the directory layout it reads and
//! writes (spec.md §6).

pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;

pub use trace_reader::TraceReader;
pub use trace_stream::{TraceDir, TraceHeader};
pub use trace_writer::TraceWriter;
