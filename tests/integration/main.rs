//! Integration tests for SCANLAB.
//!
//! Everything runs against an in-memory fixture provider; no network.

mod analysis;
mod execution;
mod fixture;
