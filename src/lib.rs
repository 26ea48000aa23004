//! # Flow Compensator
//!
//! A G-code post-processor that compensates for under-extrusion at high
//! volumetric flow rates.
//!
//! Hotends deliver slightly less plastic than commanded once the volumetric
//! flow rate climbs, because melt pressure rises faster than the extruder can
//! push. This library walks an already-sliced G-code stream, computes the
//! instantaneous volumetric flow rate of every extruding move, looks up a
//! per-material compensation multiplier on a shape-preserving cubic response
//! curve and rewrites the commanded `E` value accordingly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use flow_compensator::{
//!     CompensatorConfig, FlowCompensator, MaterialProfile, MoveTracker,
//! };
//!
//! let profile = MaterialProfile::new(
//!     "PETG",
//!     vec![(0.0, 1.0), (10.0, 1.0), (20.0, 1.025), (30.0, 1.06)],
//! );
//!
//! let mut compensator = FlowCompensator::new(CompensatorConfig::new(1.75));
//! compensator.configure_tool(0, &profile)?;
//!
//! let mut tracker = MoveTracker::new();
//! for line in gcode.lines() {
//!     let out = compensator.process_line(&mut tracker, line);
//!     println!("{out}");
//! }
//! ```

// Core modules
pub mod compensator;
pub mod config;
pub mod curve;
pub mod gcode;

// Re-export commonly used types
pub use compensator::{
    CompensatorConfig, FlowCompensator, ToolStats, ToolSummary, MULTIPLIER_EPSILON,
};
pub use config::{ConfigError, DetectionConfig, FlowConfig, MaterialConfig, OutputConfig};
pub use curve::{CurveError, MaterialProfile, ResponseCurve};
pub use gcode::{
    scan_metadata, AxisPosition, GCodeMetadata, MoveDescriptor, MoveTracker, ParsedLine,
    METADATA_SCAN_LINES,
};
