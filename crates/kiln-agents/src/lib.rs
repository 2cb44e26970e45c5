// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapters for external AI coding CLIs.
//!
//! Each supported agent (claude, cursor, codex, gemini, qwen) gets one
//! [`Adapter`] implementation: it knows the CLI's command line, its native
//! event dialect, and its session-resume semantics, and translates the
//! subprocess output into the canonical event schema.  The shared subprocess
//! supervisor in [`process`] owns spawning, line framing, garbage tolerance,
//! cancellation, and exit classification so the per-adapter code is mostly a
//! dialect parser.

pub mod adapter;
pub mod claude;
pub mod codex;
pub mod cursor;
pub mod gemini;
pub mod mock;
pub mod models;
pub mod process;
pub mod qwen;
pub mod registry;

pub use adapter::{Adapter, Availability, EventStream, RunRequest};
pub use mock::{MockAdapter, MockStep};
pub use registry::AdapterRegistry;
