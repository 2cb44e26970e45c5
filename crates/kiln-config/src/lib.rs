// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod loader;
pub mod schema;

pub use loader::load;
pub use schema::{Config, CoreConfig, ServerConfig};
