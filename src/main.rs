//! Flow Compensator CLI - G-code post-processor for high-flow compensation
//!
//! Usage:
//!   flow-compensator input.gcode output.gcode
//!   flow-compensator --material PETG input.gcode output.gcode
//!   flow-compensator --dry-run input.gcode
//!   flow-compensator --config my_config.json input.gcode output.gcode

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use std::fs;
use std::path::PathBuf;

use flow_compensator::{
    scan_metadata, CompensatorConfig, FlowCompensator, FlowConfig, MoveTracker, ToolSummary,
};

/// Compensate for under-extrusion at high volumetric flow rates
#[derive(Parser, Debug)]
#[command(name = "flow-compensator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input G-code file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output G-code file (default: overwrite input)
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Configuration file (JSON format)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override material profile (PETG, PLA, ABS, ...)
    #[arg(short, long)]
    material: Option<String>,

    /// Analyze without writing an output file
    #[arg(long)]
    dry_run: bool,

    /// Don't add compensation comments to the G-code
    #[arg(long)]
    no_comments: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let config = FlowConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let contents = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read input file {}", cli.input.display()))?;
    let lines: Vec<&str> = contents.lines().collect();

    // Header metadata drives material and diameter detection.
    let metadata = scan_metadata(lines.iter().copied());
    info!(
        "detected metadata: filament_type={:?} diameter={:?} layer_height={:?} line_width={:?}",
        metadata.filament_type, metadata.filament_diameter, metadata.layer_height,
        metadata.line_width
    );

    let filament_diameter = metadata
        .filament_diameter
        .unwrap_or(config.detection.filament_diameter);
    info!("filament diameter: {filament_diameter} mm");

    let engine_config = CompensatorConfig::new(filament_diameter)
        .with_compensation_limits(config.output.min_compensation, config.output.max_compensation)
        .with_annotations(config.output.log_changes && !cli.no_comments);
    let mut compensator = FlowCompensator::new(engine_config);

    // Multi-material mode when the config maps extruders to materials;
    // otherwise a single tool from the override / detected filament type.
    let tool_mapping = config.tool_mapping();
    if tool_mapping.is_empty() {
        let requested = cli
            .material
            .as_deref()
            .map(str::to_ascii_uppercase)
            .or(metadata.filament_type);
        let profile = config.resolve_material(requested.as_deref())?;
        info!("tool T0: using material profile: {}", profile.name);
        compensator
            .configure_tool(0, &profile)
            .with_context(|| format!("invalid profile for material '{}'", profile.name))?;
    } else {
        info!("multi-material mode: {} tools mapped", tool_mapping.len());
        for (&tool, material) in &tool_mapping {
            let profile = config.resolve_material(Some(material))?;
            info!("tool T{tool}: using material profile: {}", profile.name);
            compensator
                .configure_tool(tool, &profile)
                .with_context(|| format!("invalid profile for material '{}'", profile.name))?;
        }
        if let Some((&first, _)) = tool_mapping.iter().next() {
            compensator.set_active_tool(first);
        }
    }

    // Process the stream line by line.
    let progress = ProgressBar::new(lines.len() as u64);
    progress.set_style(ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} lines",
    )?);

    let mut tracker = MoveTracker::new();
    let mut output = String::with_capacity(contents.len());
    for line in &lines {
        output.push_str(&compensator.process_line(&mut tracker, line));
        output.push('\n');
        progress.inc(1);
    }
    progress.finish_and_clear();

    if !contents.ends_with('\n') && output.ends_with('\n') {
        output.pop();
    }

    if config.output.statistics {
        print_statistics(&compensator.statistics());
    }

    if cli.dry_run {
        println!("Dry run mode - no output file written.");
    } else {
        let output_path = cli.output.as_ref().unwrap_or(&cli.input);
        fs::write(output_path, output)
            .with_context(|| format!("failed to write output file {}", output_path.display()))?;
        println!("Output written to: {}", output_path.display());
    }

    Ok(())
}

/// Render the per-tool statistics report.
fn print_statistics(summaries: &[ToolSummary]) {
    println!("\n{}", "=".repeat(60));
    println!("FLOW COMPENSATION STATISTICS");
    println!("{}", "=".repeat(60));

    let active: Vec<_> = summaries
        .iter()
        .filter(|s| s.stats.total_moves > 0)
        .collect();

    if active.is_empty() {
        println!("\nNo extrusion moves found to process.");
        return;
    }

    for summary in &active {
        let stats = &summary.stats;
        let percent = 100.0 * stats.compensated_moves as f64 / stats.total_moves as f64;

        println!("\nTool T{} ({}):", summary.tool, summary.material);
        println!("  Total moves:     {}", stats.total_moves);
        println!(
            "  Compensated:     {} ({percent:.1}%)",
            stats.compensated_moves
        );
        println!(
            "  Flow range:      {:.1} - {:.1} mm3/s",
            stats.min_flow, stats.max_flow
        );
        println!("  Avg flow:        {:.1} mm3/s", stats.average_flow());
        println!(
            "  Multiplier:      {:.3} - {:.3}x",
            stats.min_multiplier, stats.max_multiplier
        );
    }

    let total_moves: u64 = active.iter().map(|s| s.stats.total_moves).sum();
    let total_comp: u64 = active.iter().map(|s| s.stats.compensated_moves).sum();
    println!(
        "\nTotal: {} moves, {} compensated ({:.1}%)",
        total_moves,
        total_comp,
        100.0 * total_comp as f64 / total_moves as f64
    );
    println!("{}", "=".repeat(60));
}
