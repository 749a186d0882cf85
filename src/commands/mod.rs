//! Subcommands of the driver binary beyond plain `--record`/`--replay`
//! (spec.md §12: supplemented diagnostic tooling).

pub mod trace_info;
