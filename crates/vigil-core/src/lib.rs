//! vigil-core: Shared types, events, and error handling for the Vigil network monitor.
//!
//! This crate provides the foundational types used across all Vigil components:
//! - Inventory types (Device, Port, Service) produced by scans
//! - Snapshot and diff records that make up the monitoring history
//! - Event types for the notification stream
//! - The common error taxonomy

pub mod error;
pub mod events;
pub mod snapshot;
pub mod types;

pub use error::{Transient, VigilError};
