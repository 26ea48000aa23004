//! Incremental move tracking for G-code streams.
//!
//! The tracker consumes one line at a time, maintains the running axis
//! position and commanded feedrate, and classifies each line as an extruding
//! move, a tool change or a passthrough line. Extruding moves yield a
//! [`MoveDescriptor`] with the geometric quantities the compensation engine
//! needs: extrusion length, Euclidean travel distance and feedrate.
//!
//! Lines are tokenized with an explicit character scanner rather than regular
//! expressions, so malformed numeric fields can be skipped one field at a
//! time without giving up on the rest of the line. XYZ coordinates are
//! treated as absolute, the `E` field as a relative extrusion delta (M83
//! style, which is what modern slicers emit).

use log::debug;

/// Running axis position: absolute XYZ plus the cumulative extrusion length.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Accumulated extrusion (sum of all E deltas seen so far).
    pub e: f64,
}

/// Geometric description of a single extruding move.
///
/// Constructed and consumed within one line's processing; never retained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveDescriptor {
    /// Extrusion length in mm, always `|ΔE|`. Sign carries no meaning for
    /// flow-rate magnitude.
    pub extrusion: f64,

    /// Euclidean XYZ travel distance in mm. Zero for in-place extrusion
    /// (priming or retraction moves).
    pub distance: f64,

    /// Feedrate in effect for this move, in mm/min. Zero until the stream
    /// sets one.
    pub feedrate: f64,
}

/// Classification of a single G-code line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedLine {
    /// A `G0`/`G1` move with a nonzero extrusion delta.
    Move(MoveDescriptor),
    /// A `T<n>` tool-select command.
    ToolChange(usize),
    /// Anything else: comments, travel moves, M-codes, unrecognized commands.
    Passthrough,
}

/// Incremental positional and feedrate state machine.
///
/// Feed every line of the stream through [`MoveTracker::process_line`] in
/// order; the tracker updates its internal state even for lines that do not
/// qualify as extruding moves (travel moves still update position and
/// feedrate).
#[derive(Debug, Clone, Default)]
pub struct MoveTracker {
    position: AxisPosition,
    feedrate: f64,
}

impl MoveTracker {
    /// Create a tracker at the origin with no feedrate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current axis position.
    pub fn position(&self) -> AxisPosition {
        self.position
    }

    /// Currently tracked feedrate in mm/min.
    pub fn feedrate(&self) -> f64 {
        self.feedrate
    }

    /// Process a single line, updating tracked state and classifying it.
    pub fn process_line(&mut self, raw: &str) -> ParsedLine {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            return ParsedLine::Passthrough;
        }

        let mut chars = line.chars().peekable();
        match chars.next() {
            Some('G') | Some('g') => {
                let opcode: String = take_digits(&mut chars);
                match opcode.parse::<u32>() {
                    // Only the two linear-move opcodes are moves. G92 and
                    // friends pass through without touching tracked state.
                    Ok(0) | Ok(1) => self.process_move(&mut chars),
                    _ => ParsedLine::Passthrough,
                }
            }
            Some('T') | Some('t') => {
                let tool: String = take_digits(&mut chars);
                match tool.parse::<usize>() {
                    Ok(tool) => ParsedLine::ToolChange(tool),
                    Err(_) => ParsedLine::Passthrough,
                }
            }
            _ => ParsedLine::Passthrough,
        }
    }

    /// Parse the fields of a `G0`/`G1` line and update tracked state.
    fn process_move(
        &mut self,
        chars: &mut std::iter::Peekable<std::str::Chars>,
    ) -> ParsedLine {
        let mut new_pos = self.position;
        let mut extrusion_delta: Option<f64> = None;

        loop {
            // Skip whitespace between fields
            while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
                chars.next();
            }

            let letter = match chars.peek() {
                None => break,
                Some(';') => break, // trailing comment
                Some(&c) => c,
            };
            chars.next();

            if !letter.is_ascii_alphabetic() {
                // Stray character; skip it rather than abort the line.
                debug!("skipping stray character '{letter}' in move line");
                continue;
            }

            let value_str = take_number(chars);
            let value = match value_str.parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    // Malformed field: treat it as absent and keep going.
                    debug!("skipping malformed field '{letter}{value_str}'");
                    continue;
                }
            };

            match letter.to_ascii_uppercase() {
                'X' => new_pos.x = value,
                'Y' => new_pos.y = value,
                'Z' => new_pos.z = value,
                'E' => extrusion_delta = Some(value),
                'F' => self.feedrate = value,
                _ => {} // unknown axis letter, value consumed and ignored
            }
        }

        let dx = new_pos.x - self.position.x;
        let dy = new_pos.y - self.position.y;
        let dz = new_pos.z - self.position.z;
        let distance = (dx * dx + dy * dy + dz * dz).sqrt();

        self.position.x = new_pos.x;
        self.position.y = new_pos.y;
        self.position.z = new_pos.z;

        match extrusion_delta {
            Some(delta) if delta != 0.0 => {
                self.position.e += delta;
                ParsedLine::Move(MoveDescriptor {
                    extrusion: delta.abs(),
                    distance,
                    feedrate: self.feedrate,
                })
            }
            // Travel move or explicit E0: position/feedrate already updated.
            _ => ParsedLine::Passthrough,
        }
    }
}

/// Collect a run of ASCII digits.
fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            out.push(c);
            chars.next();
        } else {
            break;
        }
    }
    out
}

/// Collect the characters of a signed decimal number.
fn take_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' {
            out.push(c);
            chars.next();
        } else {
            break;
        }
    }
    out
}
