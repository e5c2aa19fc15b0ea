//! Shared foundation for the KestrelDB storage and execution core:
//! the `Datum` value model, the error taxonomy, configuration, and
//! the small id types every other crate speaks in.

pub mod config;
pub mod datum;
pub mod error;
pub mod types;
