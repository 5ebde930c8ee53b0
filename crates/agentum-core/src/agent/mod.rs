//! Agent child process handling: structured record parsing and the
//! per-session execution supervisor.

pub mod record;
pub mod supervisor;

pub use record::AgentRecord;
pub use supervisor::{Supervisor, SupervisorDeps, SupervisorError};
