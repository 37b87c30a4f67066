//! # Store Primitives
//!
//! Fixed runtime constants for the Simtree store.
//!
//! These values are compiled into the binary and are immutable at runtime.

/// First identifier handed out for every identifier kind.
///
/// Zero is never a valid identifier, so it can be used as a range floor.
pub const FIRST_ID: u64 = 1;

/// Number of records fetched per read transaction by lazy sequences
/// (trajectories, descendants, terminal-state scans).
pub const PAGE_SIZE: usize = 256;

/// Maximum length for simulation, environment, agent, and run names.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum length for free-text descriptions.
pub const MAX_DESCRIPTION_LENGTH: usize = 4096;

/// Magic bytes for the Simtree snapshot format header.
pub const MAGIC_BYTES: &[u8; 4] = b"SIMT";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the snapshot layout.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum accepted size of an encoded snapshot (500 MB).
///
/// Checked before any decoding takes place.
pub const MAX_SNAPSHOT_SIZE: usize = 500 * 1024 * 1024;
