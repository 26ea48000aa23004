//! Header metadata scanning.
//!
//! Slicers record print settings as comments near the top of the file
//! (`; filament_type = PETG`, `; layer_height = 0.2`) and the filament
//! diameter via `M200 D1.75`. The scanner walks at most the first
//! [`METADATA_SCAN_LINES`] lines and keeps the first occurrence of each key.

/// How many lines from the top of the file are searched for metadata.
/// Slicer headers comfortably fit in this window.
pub const METADATA_SCAN_LINES: usize = 500;

/// Metadata extracted from a G-code header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GCodeMetadata {
    /// Filament type from `filament_type = <name>`, uppercased.
    pub filament_type: Option<String>,
    /// Filament diameter in mm from `M200 D<diameter>`.
    pub filament_diameter: Option<f64>,
    /// Layer height in mm from `layer_height = <value>`.
    pub layer_height: Option<f64>,
    /// Line width in mm from `line_width = <value>`.
    pub line_width: Option<f64>,
}

/// Scan the leading lines of a G-code stream for header metadata.
pub fn scan_metadata<'a>(lines: impl IntoIterator<Item = &'a str>) -> GCodeMetadata {
    let mut meta = GCodeMetadata::default();

    for line in lines.into_iter().take(METADATA_SCAN_LINES) {
        if meta.filament_type.is_none() {
            if let Some(value) = key_value(line, "filament_type") {
                meta.filament_type = Some(value.to_ascii_uppercase());
            }
        }
        if meta.filament_diameter.is_none() {
            meta.filament_diameter = m200_diameter(line);
        }
        if meta.layer_height.is_none() {
            meta.layer_height = key_value(line, "layer_height").and_then(|v| v.parse().ok());
        }
        if meta.line_width.is_none() {
            meta.line_width = key_value(line, "line_width").and_then(|v| v.parse().ok());
        }
    }

    meta
}

/// Extract the value of a `key = value` assignment, case-insensitively.
fn key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();

    let end = rest
        .find(|c: char| c.is_whitespace() || c == ';')
        .unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Extract the diameter from an `M200 D<value>` command.
fn m200_diameter(line: &str) -> Option<f64> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find("m200")? + 4;
    let rest = line[start..].trim_start();
    let rest = rest
        .strip_prefix('D')
        .or_else(|| rest.strip_prefix('d'))?;

    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}
