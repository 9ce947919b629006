//! # capsule-runtime
//!
//! Container lifecycle management for the Capsule runtime.
//!
//! Handles:
//! - **Root filesystems**: overlay assembly over shared image layers,
//!   volume binds, and reverse-order teardown.
//! - **Process bootstrap**: namespace-isolated children blocked on a
//!   command handoff pipe, and the init side that pivots and executes.
//! - **Registry**: one persisted record per container.
//! - **Networking**: bridge networks, address allocation, port publishing.
//! - **Engine**: `run`, `stop`, `remove`, `exec`, `logs`, and `commit`.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod exec;
pub mod handoff;
pub mod logs;
pub mod network;
pub mod process;
pub mod rootfs;
pub mod state;

pub use engine::{Engine, EngineParts, RunOutcome, RunRequest};
