//! Core failover engine for Starfail.
//!
//! This crate holds the five subsystems the daemon wires together every
//! tick — telemetry, collectors, scoring, decision, controller — plus
//! discovery and the local RPC surface that reads them. `starfaild` (the
//! daemon binary) and `starfailctl` (the CLI) both depend on this crate
//! rather than duplicating any of this logic.

pub mod action;
pub mod collectors;
pub mod config;
pub mod controller;
pub mod decision;
pub mod discovery;
pub mod error;
pub mod model;
pub mod rpc;
pub mod scoring;
pub mod stats;
pub mod telemetry;
pub mod transport;

/// Milliseconds since the Unix epoch. The one place this crate touches wall
/// clock time directly; everything else takes `now_ms` as a parameter so it
/// stays deterministic under test.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
