//! # capsule-image
//!
//! Image handling for the Capsule runtime.
//!
//! Handles:
//! - **Storage**: name-to-archive resolution, the shared cache of
//!   extracted lower layers, image listing, and commits.
//! - **Layers**: tar packing and unpacking, plain or gzip-compressed.
//! - **Hashing**: SHA-256 digests of committed archives.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod layer;
pub mod storage;

pub use storage::{ImageInfo, ImageStore, Materialized};
