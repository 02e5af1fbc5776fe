//! Live tail and ordering engine for agent conversation logs.
//!
//! The binary in `main.rs` wires these modules into an HTTP server; they are
//! exposed here so other frontends can drive the same engine.

pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod jsonl;
pub mod live;
pub mod locator;
pub mod ordering;
pub mod paths;
pub mod records;
