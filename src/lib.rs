//! SCANLAB: scanner source analysis and sandboxed execution engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod analysis;
pub mod api;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod storage;
pub mod types;
