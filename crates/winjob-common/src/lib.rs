//! # winjob-common
//!
//! Shared types for the winjob crates:
//! - The error taxonomy, including the OS error codes surfaced by the job API
//! - Human-readable quantities (memory sizes, CPU rates, durations) used in
//!   limit configuration

#![warn(missing_docs)]

pub mod error;
pub mod quantity;

pub use error::{LaunchStage, OsError, OsErrorCode, OsResult, WinjobError, WinjobResult};
pub use quantity::{Quantity, QuantityKind};
