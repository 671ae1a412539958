//! Shared size constants for integration tests.
//!
//! Each top-level file in `tests/` is its own crate, so shared constants are
//! pulled in with:
//!
//! ```rust
//! #[path = "common/size_constants.rs"]
//! mod size_constants;
//! ```

/// Bytes in one mebibyte.
pub const BYTES_PER_MIB: u64 = 1024 * 1024;
/// Bytes in one gibibyte.
pub const BYTES_PER_GIB: u64 = 1024 * BYTES_PER_MIB;
