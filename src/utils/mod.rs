//!
//! Utility module for the wallet client.
//!
//! Amount formatting and unit conversions shared across the codebase.
/// Utility functions for formatting and display
pub mod format;

pub use format::{COIN, coin_per_kb_to_sat_per_vbyte, format_amount, format_token_amount};
