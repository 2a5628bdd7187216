// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Capstan Tasks - Client Task Surface
//!
//! The library used from *inside* a running workflow to start, fork, kill
//! and await child processes. It is a thin caller of the server's queue
//! and resume primitives; the transport is abstracted behind
//! [`api::ProcessApi`].
//!
//! # Actions
//!
//! Task calls accept JSON-shaped maps with an `action` field:
//!
//! | Action | Description |
//! |--------|-------------|
//! | `START` | Start a child process on the current server |
//! | `STARTEXTERNAL` | Start a process on an external server |
//! | `FORK` | Fork the current process into one or more children |
//! | `KILL` | Kill processes, optionally waiting for the kill to land |
//!
//! # Synchronous waits
//!
//! With `sync: true` the task blocks, polling the children with a fixed
//! delay. With `sync: true, suspend: true` it instead persists a wait
//! condition and returns a reentrant suspend: the calling process yields
//! its execution slot and this task step is re-entered once every awaited
//! child is terminal — to the workflow author it looks like an ordinary
//! blocking call.
//!
//! # Modules
//!
//! - [`api`]: The process API boundary and retry helper
//! - [`error`]: Task error types
//! - [`params`]: Task input parsing
//! - [`task`]: The task implementation and result shaping

#![deny(missing_docs)]

/// The process API boundary the task surface calls.
pub mod api;

/// Error types for the task surface.
pub mod error;

/// Task input parsing.
pub mod params;

/// The task implementation.
pub mod task;

pub use api::{ProcessApi, ProcessEntry, StartProcessResponse};
pub use error::TaskError;
pub use params::{Action, ForkParams, KillParams, StartParams, TaskParams};
pub use task::{ProcessTask, ResumePayload, TaskResult};
