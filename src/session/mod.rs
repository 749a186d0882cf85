//! The recorder and replayer engines (spec.md §4.6, §4.7): the two main
//! loops that drive tracees through the controller and the trace codec.

pub mod record_session;
pub mod replay_session;

pub use record_session::RecordSession;
pub use replay_session::ReplaySession;
