//! Multi-tool flow compensation engine.
//!
//! The engine owns one response curve and one statistics record per logical
//! tool (extruder), tracks which tool is active, converts each extruding
//! move into a volumetric flow rate, queries the active tool's curve for a
//! compensation multiplier and rewrites the `E` field of the line.
//!
//! ## Tool policy
//!
//! Switching the active tool to one without a configured profile is allowed
//! and degrades to pass-through: the multiplier is 1.0 and no line is marked
//! compensated, but moves are still counted in that tool's statistics. A
//! `T<n>` command in the stream only switches when the target tool is
//! configured; the command line itself always passes through verbatim.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use log::{debug, warn};

use crate::curve::{CurveError, MaterialProfile, ResponseCurve};
use crate::gcode::{MoveDescriptor, MoveTracker, ParsedLine};

/// Multipliers closer to 1.0 than this leave the line untouched.
pub const MULTIPLIER_EPSILON: f64 = 0.001;

/// Configuration for the compensation engine.
#[derive(Debug, Clone)]
pub struct CompensatorConfig {
    /// Filament diameter in mm. Used to compute the cross-section area once;
    /// per-material diameter differences are not modeled.
    pub filament_diameter: f64,

    /// Lower safety bound on the multiplier, applied after curve evaluation.
    pub min_compensation: f64,

    /// Upper safety bound on the multiplier, applied after curve evaluation.
    pub max_compensation: f64,

    /// Append a `; flow_comp: ...` annotation to compensated lines.
    pub annotate: bool,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            filament_diameter: 1.75,
            min_compensation: 0.8,
            max_compensation: 1.5,
            annotate: true,
        }
    }
}

impl CompensatorConfig {
    /// Create a configuration with the given filament diameter.
    pub fn new(filament_diameter: f64) -> Self {
        Self {
            filament_diameter,
            ..Default::default()
        }
    }

    /// Set the multiplier safety band.
    pub fn with_compensation_limits(mut self, min: f64, max: f64) -> Self {
        self.min_compensation = min;
        self.max_compensation = max;
        self
    }

    /// Enable or disable line annotations.
    pub fn with_annotations(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    /// Filament cross-section area in mm².
    pub fn filament_cross_section(&self) -> f64 {
        let r = self.filament_diameter / 2.0;
        PI * r * r
    }
}

/// Running statistics for one tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolStats {
    /// Extruding moves seen while this tool was active.
    pub total_moves: u64,
    /// Moves whose `E` value was actually rewritten.
    pub compensated_moves: u64,
    /// Lowest flow rate seen (mm³/s). `INFINITY` until the first move.
    pub min_flow: f64,
    /// Highest flow rate seen (mm³/s).
    pub max_flow: f64,
    /// Sum of all flow rates, for averaging.
    pub total_flow: f64,
    /// Lowest multiplier applied. `INFINITY` until the first move.
    pub min_multiplier: f64,
    /// Highest multiplier applied.
    pub max_multiplier: f64,
}

impl Default for ToolStats {
    fn default() -> Self {
        Self {
            total_moves: 0,
            compensated_moves: 0,
            min_flow: f64::INFINITY,
            max_flow: 0.0,
            total_flow: 0.0,
            min_multiplier: f64::INFINITY,
            max_multiplier: 0.0,
        }
    }
}

impl ToolStats {
    /// Average flow rate over all counted moves, or 0 without moves.
    pub fn average_flow(&self) -> f64 {
        if self.total_moves > 0 {
            self.total_flow / self.total_moves as f64
        } else {
            0.0
        }
    }
}

/// Read-only statistics snapshot for one tool.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    /// Tool id.
    pub tool: usize,
    /// Material name, or `unknown` for a tool that saw moves without being
    /// configured.
    pub material: String,
    /// Accumulated statistics.
    pub stats: ToolStats,
}

/// Curve and material assigned to a configured tool.
#[derive(Debug, Clone)]
struct ToolProfile {
    material: String,
    curve: ResponseCurve,
}

/// The compensation engine.
///
/// One instance processes a whole stream; tool state persists for its
/// lifetime and is never destroyed mid-run.
#[derive(Debug)]
pub struct FlowCompensator {
    config: CompensatorConfig,
    /// Cross-section area, computed once from the configured diameter.
    filament_area: f64,
    /// Configured tools. Configuration is an explicit step; nothing here is
    /// auto-created.
    tools: BTreeMap<usize, ToolProfile>,
    /// Per-tool statistics, created lazily on first use.
    stats: BTreeMap<usize, ToolStats>,
    active_tool: usize,
}

impl FlowCompensator {
    /// Create an engine with no tools configured and tool 0 active.
    pub fn new(config: CompensatorConfig) -> Self {
        let filament_area = config.filament_cross_section();
        Self {
            config,
            filament_area,
            tools: BTreeMap::new(),
            stats: BTreeMap::new(),
            active_tool: 0,
        }
    }

    /// Filament cross-section area in mm².
    pub fn filament_area(&self) -> f64 {
        self.filament_area
    }

    /// The currently active tool id.
    pub fn active_tool(&self) -> usize {
        self.active_tool
    }

    /// Whether a tool has a configured response curve.
    pub fn is_tool_configured(&self, tool: usize) -> bool {
        self.tools.contains_key(&tool)
    }

    /// Number of configured tools.
    pub fn configured_tools(&self) -> usize {
        self.tools.len()
    }

    /// Material name assigned to a tool, if configured.
    pub fn tool_material(&self, tool: usize) -> Option<&str> {
        self.tools.get(&tool).map(|t| t.material.as_str())
    }

    /// Build and store the response curve for a tool.
    ///
    /// Re-configuring an existing tool replaces its curve and material but
    /// preserves accumulated statistics.
    pub fn configure_tool(
        &mut self,
        tool: usize,
        profile: &MaterialProfile,
    ) -> Result<(), CurveError> {
        let curve = ResponseCurve::from_profile(profile)?;
        let (min, max) = curve.domain();
        debug!(
            "tool T{tool}: material '{}', flow range {min:.1} - {max:.1} mm3/s",
            profile.name
        );

        self.tools.insert(
            tool,
            ToolProfile {
                material: profile.name.clone(),
                curve,
            },
        );
        self.stats.entry(tool).or_default();
        Ok(())
    }

    /// Reassign the active tool.
    ///
    /// Switching to an unconfigured tool is allowed; the engine degrades to
    /// a 1.0 multiplier until a configured tool becomes active again.
    pub fn set_active_tool(&mut self, tool: usize) {
        if !self.tools.contains_key(&tool) {
            debug!("tool T{tool} has no material profile; compensation disabled while active");
        }
        self.active_tool = tool;
    }

    /// React to a `T<n>` command in the stream.
    ///
    /// Only switches when the target tool is configured; the command line is
    /// never rewritten either way.
    pub fn tool_change(&mut self, tool: usize) {
        if self.tools.contains_key(&tool) {
            self.active_tool = tool;
        } else {
            debug!("ignoring tool change to unconfigured tool T{tool}");
        }
    }

    /// Volumetric flow rate in mm³/s for a move.
    ///
    /// Returns 0 for zero-distance moves (priming/retraction), which also
    /// guards the division.
    pub fn flow_rate(&self, extrusion: f64, distance: f64, feedrate: f64) -> f64 {
        if distance == 0.0 {
            return 0.0;
        }
        // mm³/min, then per second
        extrusion * self.filament_area / distance * feedrate / 60.0
    }

    /// Compensation multiplier for a flow rate on the active tool.
    ///
    /// 1.0 when the active tool has no curve; otherwise the curve value
    /// (clamped to the curve's domain) clamped again into the configured
    /// safety band.
    pub fn multiplier(&self, flow_rate: f64) -> f64 {
        let Some(profile) = self.tools.get(&self.active_tool) else {
            return 1.0;
        };

        profile
            .curve
            .evaluate(flow_rate)
            .clamp(self.config.min_compensation, self.config.max_compensation)
    }

    /// Apply compensation to an extruding move's line.
    ///
    /// Updates the active tool's statistics, and returns the line with its
    /// `E` value scaled when the multiplier is meaningful; otherwise the
    /// line is returned unchanged.
    pub fn compensate_line(&mut self, line: &str, mv: &MoveDescriptor) -> String {
        let flow_rate = self.flow_rate(mv.extrusion, mv.distance, mv.feedrate);
        let multiplier = self.multiplier(flow_rate);

        let stats = self.stats.entry(self.active_tool).or_default();
        stats.total_moves += 1;
        stats.total_flow += flow_rate;
        stats.min_flow = stats.min_flow.min(flow_rate);
        stats.max_flow = stats.max_flow.max(flow_rate);
        stats.min_multiplier = stats.min_multiplier.min(multiplier);
        stats.max_multiplier = stats.max_multiplier.max(multiplier);

        if (multiplier - 1.0).abs() < MULTIPLIER_EPSILON {
            return line.to_string();
        }

        let Some(rewritten) = rewrite_extrusion(line, multiplier) else {
            // The tracker saw a valid E field, so this is unreachable in
            // practice; emit the original rather than corrupt the stream.
            warn!("could not rewrite extrusion field of line: {line}");
            return line.to_string();
        };

        let stats = self.stats.entry(self.active_tool).or_default();
        stats.compensated_moves += 1;

        if self.config.annotate {
            let tool_tag = if self.tools.len() > 1 {
                format!(" T{}", self.active_tool)
            } else {
                String::new()
            };
            format!(
                "{} ; flow_comp{tool_tag}: {flow_rate:.1}mm3/s x{multiplier:.3}",
                rewritten.trim_end()
            )
        } else {
            rewritten
        }
    }

    /// Process one line of the stream through a tracker and this engine.
    ///
    /// This is the per-line pipeline: state update, classification,
    /// compensation. Tool changes and non-move lines come back verbatim.
    pub fn process_line(&mut self, tracker: &mut MoveTracker, line: &str) -> String {
        match tracker.process_line(line) {
            ParsedLine::Move(mv) => self.compensate_line(line, &mv),
            ParsedLine::ToolChange(tool) => {
                self.tool_change(tool);
                line.to_string()
            }
            ParsedLine::Passthrough => line.to_string(),
        }
    }

    /// Read-only statistics snapshot, ordered by tool id.
    pub fn statistics(&self) -> Vec<ToolSummary> {
        self.stats
            .iter()
            .map(|(&tool, &stats)| ToolSummary {
                tool,
                material: self
                    .tools
                    .get(&tool)
                    .map(|t| t.material.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                stats,
            })
            .collect()
    }
}

/// Replace the numeric value of the `E` field with `value * multiplier`.
///
/// Only the command portion of the line is searched; a trailing comment is
/// preserved byte-for-byte. The new value is formatted with 6 decimals,
/// trailing zeros and a trailing decimal point trimmed, so output is
/// reproducible.
fn rewrite_extrusion(line: &str, multiplier: f64) -> Option<String> {
    let command_end = line.find(';').unwrap_or(line.len());
    let command = &line[..command_end];

    for (idx, c) in command.char_indices() {
        if c != 'E' && c != 'e' {
            continue;
        }

        let value_start = idx + 1;
        let value_end = command[value_start..]
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .map(|off| value_start + off)
            .unwrap_or(command.len());

        let Ok(value) = command[value_start..value_end].parse::<f64>() else {
            continue;
        };

        return Some(format!(
            "{}{}{}{}{}",
            &command[..idx],
            c,
            format_extrusion(value * multiplier),
            &command[value_end..],
            &line[command_end..],
        ));
    }

    None
}

/// Fixed-precision extrusion formatting: 6 decimals, trailing zeros and a
/// trailing decimal point trimmed.
fn format_extrusion(value: f64) -> String {
    let formatted = format!("{value:.6}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petg_profile() -> MaterialProfile {
        MaterialProfile::new(
            "PETG",
            vec![(0.0, 1.0), (10.0, 1.0), (20.0, 1.025), (30.0, 1.06)],
        )
    }

    fn pla_profile() -> MaterialProfile {
        MaterialProfile::new(
            "PLA",
            vec![(0.0, 1.0), (15.0, 1.0), (25.0, 1.02), (35.0, 1.05)],
        )
    }

    fn configured_compensator() -> FlowCompensator {
        let mut comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        comp.configure_tool(0, &petg_profile()).unwrap();
        comp
    }

    #[test]
    fn test_filament_area() {
        let comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        assert!((comp.filament_area() - 2.4053).abs() < 0.0001);
    }

    #[test]
    fn test_flow_rate_example() {
        // 5.55mm of filament over a 10mm move at 3000mm/min is ~66.7mm³/s.
        let comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        let flow = comp.flow_rate(5.55, 10.0, 3000.0);
        assert!((flow - 66.7).abs() < 0.1);
    }

    #[test]
    fn test_flow_rate_zero_distance() {
        let comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        assert_eq!(comp.flow_rate(5.0, 0.0, 3000.0), 0.0);
        assert_eq!(comp.flow_rate(0.0, 0.0, 0.0), 0.0);
        assert_eq!(comp.flow_rate(-2.0, 0.0, 9999.0), 0.0);
    }

    #[test]
    fn test_multiplier_at_control_points() {
        let comp = configured_compensator();
        assert!((comp.multiplier(10.0) - 1.0).abs() < 1e-12);
        assert!((comp.multiplier(20.0) - 1.025).abs() < 1e-12);
        assert!((comp.multiplier(30.0) - 1.06).abs() < 1e-12);
    }

    #[test]
    fn test_multiplier_clamped_to_safety_band() {
        let mut comp = FlowCompensator::new(
            CompensatorConfig::new(1.75).with_compensation_limits(0.8, 1.5),
        );
        comp.configure_tool(
            0,
            &MaterialProfile::new("HOT", vec![(0.0, 0.5), (10.0, 2.0)]),
        )
        .unwrap();

        assert!((comp.multiplier(0.0) - 0.8).abs() < 1e-12);
        assert!((comp.multiplier(10.0) - 1.5).abs() < 1e-12);
        for i in 0..=100 {
            let m = comp.multiplier(10.0 * i as f64 / 100.0);
            assert!((0.8..=1.5).contains(&m));
        }
    }

    #[test]
    fn test_unconfigured_tool_passes_through() {
        let mut comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        comp.set_active_tool(3);

        assert!((comp.multiplier(66.7) - 1.0).abs() < 1e-12);

        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        let line = "G1 X110 Y100 E5.55";
        assert_eq!(comp.compensate_line(line, &mv), line);

        let summaries = comp.statistics();
        let stats = &summaries[0];
        assert_eq!(stats.tool, 3);
        assert_eq!(stats.material, "unknown");
        assert_eq!(stats.stats.total_moves, 1);
        assert_eq!(stats.stats.compensated_moves, 0);
    }

    #[test]
    fn test_near_unity_multiplier_leaves_line_alone() {
        let mut comp = configured_compensator();
        // 0 flow sits on the flat part of the curve: multiplier exactly 1.0.
        let mv = MoveDescriptor {
            extrusion: 1.0,
            distance: 0.0,
            feedrate: 3000.0,
        };
        let line = "G1 E1.0 F3000";
        assert_eq!(comp.compensate_line(line, &mv), line);
        assert_eq!(comp.statistics()[0].stats.compensated_moves, 0);
        assert_eq!(comp.statistics()[0].stats.total_moves, 1);
    }

    #[test]
    fn test_compensate_rewrites_extrusion() {
        let mut comp = configured_compensator();
        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        // ~66.7mm³/s clamps to the top of the curve: x1.06.
        let out = comp.compensate_line("G1 X110 Y100 E5.55", &mv);
        assert!(out.starts_with("G1 X110 Y100 E5.883"));
        assert!(out.contains("; flow_comp: 66.7mm3/s x1.060"));
        assert_eq!(comp.statistics()[0].stats.compensated_moves, 1);
    }

    #[test]
    fn test_compensated_value_round_trips() {
        let mut comp = configured_compensator();
        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        let out = comp.compensate_line("G1 X110 Y100 E5.55", &mv);

        let e_start = out.find('E').unwrap() + 1;
        let e_str: String = out[e_start..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        let reparsed: f64 = e_str.parse().unwrap();
        assert!((reparsed - 5.55 * 1.06).abs() < 1e-6);
    }

    #[test]
    fn test_annotation_can_be_disabled() {
        let mut comp = FlowCompensator::new(
            CompensatorConfig::new(1.75).with_annotations(false),
        );
        comp.configure_tool(0, &petg_profile()).unwrap();
        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        let out = comp.compensate_line("G1 X110 Y100 E5.55", &mv);
        assert!(!out.contains("flow_comp"));
        assert!(out.contains("E5.883"));
    }

    #[test]
    fn test_annotation_tags_tool_in_multi_tool_setups() {
        let mut comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        comp.configure_tool(0, &petg_profile()).unwrap();
        comp.configure_tool(1, &pla_profile()).unwrap();

        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        let out = comp.compensate_line("G1 X110 Y100 E5.55", &mv);
        assert!(out.contains("; flow_comp T0:"));
    }

    #[test]
    fn test_per_tool_statistics_isolation() {
        let mut comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        comp.configure_tool(0, &petg_profile()).unwrap();
        comp.configure_tool(1, &pla_profile()).unwrap();

        // Tool 0 sees a high-flow move.
        let hot = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        comp.compensate_line("G1 X10 E5.55", &hot);

        // Tool 1 independently sees a ~20mm³/s move.
        comp.tool_change(1);
        let warm = MoveDescriptor {
            extrusion: 1.6631,
            distance: 10.0,
            feedrate: 3000.0,
        };
        comp.compensate_line("G1 X20 E1.6631", &warm);

        let summaries = comp.statistics();
        assert_eq!(summaries.len(), 2);

        let t0 = &summaries[0];
        assert_eq!(t0.material, "PETG");
        assert_eq!(t0.stats.total_moves, 1);
        assert!((t0.stats.max_flow - 66.7).abs() < 0.1);

        let t1 = &summaries[1];
        assert_eq!(t1.material, "PLA");
        assert_eq!(t1.stats.total_moves, 1);
        assert!((t1.stats.max_flow - 20.0).abs() < 0.1);
    }

    #[test]
    fn test_reconfigure_preserves_statistics() {
        let mut comp = configured_compensator();
        let mv = MoveDescriptor {
            extrusion: 5.55,
            distance: 10.0,
            feedrate: 3000.0,
        };
        comp.compensate_line("G1 X10 E5.55", &mv);
        assert_eq!(comp.statistics()[0].stats.total_moves, 1);

        comp.configure_tool(0, &pla_profile()).unwrap();
        assert_eq!(comp.statistics()[0].stats.total_moves, 1);
        assert_eq!(comp.statistics()[0].material, "PLA");
    }

    #[test]
    fn test_tool_change_ignores_unconfigured_target() {
        let mut comp = configured_compensator();
        comp.tool_change(7);
        assert_eq!(comp.active_tool(), 0);

        // The explicit setter honors the request and degrades instead.
        comp.set_active_tool(7);
        assert_eq!(comp.active_tool(), 7);
    }

    #[test]
    fn test_invalid_profile_is_fatal_for_configuration() {
        let mut comp = FlowCompensator::new(CompensatorConfig::default());
        let result =
            comp.configure_tool(0, &MaterialProfile::new("BAD", vec![(0.0, 1.0)]));
        assert!(result.is_err());
        assert!(!comp.is_tool_configured(0));
    }

    #[test]
    fn test_process_line_pipeline() {
        let mut comp = FlowCompensator::new(CompensatorConfig::new(1.75));
        comp.configure_tool(0, &petg_profile()).unwrap();
        comp.configure_tool(1, &pla_profile()).unwrap();
        let mut tracker = MoveTracker::new();

        assert_eq!(comp.process_line(&mut tracker, "; header"), "; header");
        assert_eq!(comp.process_line(&mut tracker, "G1 F3000"), "G1 F3000");
        assert_eq!(comp.process_line(&mut tracker, "T1"), "T1");
        assert_eq!(comp.active_tool(), 1);

        let out = comp.process_line(&mut tracker, "G1 X10 E5.55");
        assert!(out.contains("E5.8"), "line was not compensated: {out}");
    }

    #[test]
    fn test_format_extrusion_trimming() {
        assert_eq!(format_extrusion(5.883), "5.883");
        assert_eq!(format_extrusion(5.0), "5");
        assert_eq!(format_extrusion(0.5), "0.5");
        assert_eq!(format_extrusion(1.234567891), "1.234568");
        assert_eq!(format_extrusion(-2.12), "-2.12");
    }

    #[test]
    fn test_rewrite_preserves_comment() {
        let out = rewrite_extrusion("G1 X1 E2.0 F300 ; wall E9", 1.1).unwrap();
        assert_eq!(out, "G1 X1 E2.2 F300 ; wall E9");
    }

    #[test]
    fn test_rewrite_without_extrusion_field() {
        assert!(rewrite_extrusion("G1 X1 Y2", 1.1).is_none());
    }
}
