//! vigil-monitor: Scan scheduling and monitoring orchestration for Vigil.
//!
//! The scheduler runs recurring and manual scans against an external scan
//! tool under a concurrency ceiling, the orchestrator turns completed scans
//! into persisted snapshots and diffs, and the health loop keeps an
//! up-to-date view of component state.

pub mod config;
pub mod health;
pub mod orchestrator;
pub mod resilience;
pub mod scanner;
pub mod scheduler;
pub mod target;
