//! vigil-diff: Pure snapshot comparison for the Vigil network monitor.
//!
//! [`compute_diff`] is a total, deterministic, side-effect-free function
//! over two snapshots: same inputs always yield a byte-identical diff.

pub mod engine;

pub use engine::{compute_diff, compute_diff_with, DeviceIdentity, DiffOptions};
