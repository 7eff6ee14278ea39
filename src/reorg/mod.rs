//! Chain reorganization detection.
//!
//! ## How It Works
//!
//! 1. **Stored hashes**: every permanent block keeps the hash it was indexed with
//! 2. **Periodic comparison**: a background task compares the newest
//!    `REORG_CHECK_DEPTH` stored hashes with the chain every
//!    `REORG_CHECK_INTERVAL_SECS`
//! 3. **Signal**: the lowest mismatching height goes into the shared reorg set
//! 4. **Purge**: the live block source re-emits that height, the round that
//!    reaches it stops, and the round controller deletes every row at or
//!    above it before the next round rewrites anything
//!
//! ## Reorg Frequency on Gnosis Chain
//!
//! Reorgs deeper than a handful of blocks are rare, so a depth of 18 blocks
//! covers practically every reorg that happens before finality.

pub mod detector;

pub use detector::ReorgChecker;
