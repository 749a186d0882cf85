//! Error taxonomy for the core, per the design's error-handling section.
//!
//! Grounded on the teacher's `ed_assert!`-and-abort style for truly
//! unrecoverable in-flight ptrace inconsistencies, but surfaced as a typed
//! `Result` at the boundaries (trace open, session construction, CLI) the
//! way the pack's other process-supervision crates do (see
//! `ipdelete-linux-isolation-learning`, which carries `thiserror` for the
//! same reason: typed, matchable error variants at subsystem seams).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RdError {
    #[error("prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("trace format error: {0}")]
    TraceFormat(String),

    #[error("divergence at event {event_seq}: {detail}")]
    Divergence { event_seq: u64, detail: String },

    #[error("tracee {tid} died unexpectedly: {detail}")]
    TraceeDiedUnexpectedly { tid: i32, detail: String },

    #[error("transient OS error on {0}: {1}")]
    TransientOs(&'static str, std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type RdResult<T> = Result<T, RdError>;

impl RdError {
    /// Maps the taxonomy onto the process exit codes promised by the
    /// driver's external interface: 0 is reserved for clean termination and
    /// is never produced here.
    pub fn exit_code(&self) -> i32 {
        match self {
            RdError::Prerequisite(_) => 1,
            RdError::TraceFormat(_) => 2,
            RdError::Divergence { .. } => 3,
            RdError::TraceeDiedUnexpectedly { .. } => 4,
            RdError::TransientOs(..) => 5,
            RdError::Io(_) => 6,
            RdError::Nix(_) => 7,
        }
    }
}
