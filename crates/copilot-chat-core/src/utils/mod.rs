//! Utility functions for string formatting and log-safe rendering.

pub mod format;

pub use format::{preview, redact_secret, truncate_string};
