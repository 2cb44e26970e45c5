// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Storage boundaries of the orchestration core.
//!
//! The core consumes three external collaborators: a **Project Store**
//! (project id → workspace path and agent preferences), an append-only
//! **Message Store** (the persisted transcript), and a **System-Prompt
//! Loader** (role markdown).  This crate defines those traits plus two
//! Message Store backends: in-memory (tests, ephemeral deploys) and JSONL
//! (one append-only file per project).

pub mod jsonl;
pub mod message;
pub mod project;
pub mod prompt;

pub use jsonl::JsonlMessageStore;
pub use message::{MemoryMessageStore, MessageStore};
pub use project::{MemoryProjectStore, Project, ProjectStore};
pub use prompt::SystemPromptLoader;

/// Failures at the persistence boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}
