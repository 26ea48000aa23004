//! Material response curves.
//!
//! A material's under-extrusion behavior is described by control points
//! `(flow rate, multiplier)`. This module fits a shape-preserving piecewise
//! cubic through those points — a PCHIP interpolant with Fritsch–Carlson
//! derivative limiting — and answers multiplier queries for arbitrary flow
//! rates, clamped to the control-point domain.
//!
//! Shape preservation is the property under test here: a natural cubic
//! spline through a monotone control sequence can overshoot between samples
//! and briefly *invert* the compensation direction. The PCHIP derivative
//! rules guarantee the interpolant stays monotone wherever the data is.

use std::cmp::Ordering;

use thiserror::Error;

/// Errors from building a response curve.
#[derive(Debug, Error)]
pub enum CurveError {
    /// Fewer than two control points were supplied.
    #[error("at least 2 control points are required, got {0}")]
    TooFewPoints(usize),

    /// Two control points share the same flow-rate coordinate.
    #[error("control points contain duplicate flow rate {0}")]
    DuplicateFlowRate(f64),
}

/// A named material and its raw compensation control points.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProfile {
    /// Material name, e.g. `PETG`.
    pub name: String,
    /// `(flow rate mm³/s, multiplier)` samples. Order does not matter; the
    /// curve sorts them before fitting.
    pub points: Vec<(f64, f64)>,
}

impl MaterialProfile {
    /// Create a profile from a name and control points.
    pub fn new(name: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }
}

/// A shape-preserving piecewise-cubic interpolant over control points.
///
/// # Invariants
///
/// - Flow-rate coordinates are strictly increasing.
/// - Evaluating at the minimum or maximum control flow returns exactly that
///   control point's multiplier.
/// - Evaluation clamps its argument into the control-point domain, so the
///   curve is total over all finite inputs.
#[derive(Debug, Clone)]
pub struct ResponseCurve {
    /// Control-point flow rates, strictly increasing.
    flows: Vec<f64>,
    /// Control-point multipliers.
    multipliers: Vec<f64>,
    /// Interpolant derivative at each control point.
    derivatives: Vec<f64>,
}

impl ResponseCurve {
    /// Fit a curve through the given control points.
    ///
    /// Points are sorted by flow rate first, so unsorted input is fine.
    /// Fails when fewer than two points are supplied or two points share a
    /// flow-rate coordinate.
    pub fn from_points(points: &[(f64, f64)]) -> Result<Self, CurveError> {
        if points.len() < 2 {
            return Err(CurveError::TooFewPoints(points.len()));
        }

        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        for pair in sorted.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(CurveError::DuplicateFlowRate(pair[0].0));
            }
        }

        let flows: Vec<f64> = sorted.iter().map(|p| p.0).collect();
        let multipliers: Vec<f64> = sorted.iter().map(|p| p.1).collect();
        let derivatives = pchip_derivatives(&flows, &multipliers);

        Ok(Self {
            flows,
            multipliers,
            derivatives,
        })
    }

    /// Fit a curve for a material profile.
    pub fn from_profile(profile: &MaterialProfile) -> Result<Self, CurveError> {
        Self::from_points(&profile.points)
    }

    /// The control-point flow-rate domain `(min, max)`.
    pub fn domain(&self) -> (f64, f64) {
        (self.flows[0], *self.flows.last().unwrap_or(&self.flows[0]))
    }

    /// Evaluate the multiplier at a flow rate.
    ///
    /// The argument is clamped into the control-point domain; the boundary
    /// control-point multipliers are returned exactly at and beyond the
    /// boundaries.
    pub fn evaluate(&self, flow: f64) -> f64 {
        let n = self.flows.len();
        if flow <= self.flows[0] {
            return self.multipliers[0];
        }
        if flow >= self.flows[n - 1] {
            return self.multipliers[n - 1];
        }

        // Index of the segment [flows[k], flows[k+1]) containing `flow`.
        let k = self.flows.partition_point(|&x| x <= flow) - 1;

        let h = self.flows[k + 1] - self.flows[k];
        let t = (flow - self.flows[k]) / h;

        // Cubic Hermite basis
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * self.multipliers[k]
            + h10 * h * self.derivatives[k]
            + h01 * self.multipliers[k + 1]
            + h11 * h * self.derivatives[k + 1]
    }
}

/// Compute PCHIP endpoint and interior derivatives.
///
/// Interior points use the weighted harmonic mean of the adjacent secant
/// slopes, zeroed at local extrema; endpoints use a one-sided three-point
/// estimate limited so the first segment cannot overshoot.
fn pchip_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();

    let h: Vec<f64> = (0..n - 1).map(|k| xs[k + 1] - xs[k]).collect();
    let secants: Vec<f64> = (0..n - 1).map(|k| (ys[k + 1] - ys[k]) / h[k]).collect();

    if n == 2 {
        return vec![secants[0]; 2];
    }

    let mut d = vec![0.0; n];

    for k in 1..n - 1 {
        let s_prev = secants[k - 1];
        let s_next = secants[k];
        if s_prev * s_next <= 0.0 {
            // Local extremum (or flat): force a horizontal tangent.
            d[k] = 0.0;
        } else {
            let w1 = 2.0 * h[k] + h[k - 1];
            let w2 = h[k] + 2.0 * h[k - 1];
            d[k] = (w1 + w2) / (w1 / s_prev + w2 / s_next);
        }
    }

    d[0] = edge_derivative(h[0], h[1], secants[0], secants[1]);
    d[n - 1] = edge_derivative(h[n - 2], h[n - 3], secants[n - 2], secants[n - 3]);

    d
}

/// One-sided three-point derivative estimate at a boundary, limited for
/// shape preservation.
fn edge_derivative(h0: f64, h1: f64, s0: f64, s1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * s0 - h0 * s1) / (h0 + h1);

    if sign(d) != sign(s0) {
        0.0
    } else if sign(s0) != sign(s1) && d.abs() > 3.0 * s0.abs() {
        3.0 * s0
    } else {
        d
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}
