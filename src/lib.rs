//! CMASS region backfill library - shared modules for the backfill binaries.

pub mod backfill;
pub mod checkpoint;
pub mod csv;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod roster;
pub mod scoring;
pub mod store;
