// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-project orchestration core.
//!
//! One [`Orchestrator`] task per active project serializes submitted
//! instructions, supervises the adapter subprocess, stamps every canonical
//! event with a project-scoped sequence number, persists it, and fans it out
//! to subscribers.  The [`Supervisor`] owns the project → orchestrator map
//! and reaps idle orchestrators; the [`session`] module keeps the per
//! (project, agent) conversation state used for session resume.

pub mod orchestrator;
pub mod request;
pub mod session;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use orchestrator::{CancelOutcome, Orchestrator, OrchestratorHandle};
pub use request::SubmitRequest;
pub use session::{project_sessions, Session, SessionStore};
pub use supervisor::{Supervisor, SupervisorError};
