//! Domain Layer - Market data types and symbol bookkeeping.
//!
//! Pure Rust types with no I/O. Everything here is owned by a single
//! connection's session task or by callers, never shared mutably.

/// Bars, ticks and symbol descriptors.
pub mod market_data;

/// Live spot subscription tracking.
pub mod subscription;

/// Symbol directory and alias table.
pub mod symbols;
