//! # Tamarack Configuration Module
//!
//! Centralizes the configuration constants for tamarack. Several of them
//! are interdependent (the refcount bucket shape must match the on-disk
//! file size, the id-path split must cover the whole id space) and keeping
//! them in one place with their dependencies documented prevents mismatches.

pub mod constants;
pub use constants::*;
