//! G-code parsing module.
//!
//! This module provides the incremental move tracker that turns raw G-code
//! lines into per-move geometric quantities, plus a small scanner for the
//! metadata that slicers embed in file headers.

pub mod metadata;
pub mod tracker;

pub use metadata::{scan_metadata, GCodeMetadata, METADATA_SCAN_LINES};
pub use tracker::{AxisPosition, MoveDescriptor, MoveTracker, ParsedLine};
