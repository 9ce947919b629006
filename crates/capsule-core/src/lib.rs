//! # capsule-core
//!
//! Low-level Linux isolation primitives for the Capsule runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: per-container groups with memory, CPU weight, and
//!   cpuset limits.
//! - **Filesystem**: overlay and bind mounts, `pivot_root`, and the
//!   `/proc` and `/dev` mounts of a fresh root.
//! - **Namespaces**: clone flags for new containers and `setns(2)` for
//!   entering running ones.
//! - **Signals**: termination and liveness checks.
//! - **Teardown**: ordered rollback and aggregated best-effort cleanup.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod signal;
pub mod teardown;
