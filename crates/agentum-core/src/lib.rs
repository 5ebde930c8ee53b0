//! # agentum-core
//!
//! Session and event runtime for Agentum, a backend service that orchestrates
//! autonomous agent executions: it receives a natural-language task, spawns a
//! sandboxed agent child process, streams typed events to subscribers in real
//! time, persists a durable transcript, and supports cancellation and
//! resumption.
//!
//! This crate is transport-agnostic; the HTTP/SSE surface lives in
//! `agentum-server`.
//!
//! ## Key concepts
//!
//! - **Session**: one user-initiated task run (or chain of resumed runs)
//! - **Supervisor**: the task owning the agent child process for one run
//! - **Hub**: per-session fan-out bus assigning monotonic sequence numbers
//! - **Profile**: the permission rule document evaluated per tool call

pub mod agent;
pub mod auth;
pub mod config;
pub mod context;
pub mod events;
pub mod fs_layout;
pub mod hub;
pub mod lifecycle;
pub mod permissions;
pub mod runner;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod writer;

// Re-export commonly used types
pub use context::AgentumContext;
pub use events::{EventBody, EventKind, EventRecord};
pub use runner::{RunOverrides, TaskRunner};
pub use session::{Session, SessionStatus};
