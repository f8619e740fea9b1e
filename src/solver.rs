//! Two-anchor trilateration.
//!
//! With two anchors the tag lies on the intersection of two circles, which
//! has two mirror-image solutions about the anchor baseline. The solver always
//! returns the one on the left of the baseline direction (anchor 1 towards
//! anchor 2); for anchors at (0,0) and (2,0) that is the `y >= 0` half-plane.
//! The deployment must keep the tag on that side.

use thiserror::Error;

use crate::config::PositioningConfig;
use crate::error::Result;
use crate::types::{baseline, perp, AnchorId, Point2};

/// Why a pair of distances has no position
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SolveError {
    #[error("distances must be positive (d1={dist1}, d2={dist2})")]
    NonPositiveDistance { dist1: f64, dist2: f64 },

    #[error("anchors coincide")]
    CoincidentAnchors,

    #[error("distance circles do not intersect (h^2={h_squared:.6})")]
    NonIntersecting { h_squared: f64 },
}

impl SolveError {
    /// True when the distances contradict the anchor geometry, as opposed to
    /// being unusable input.
    pub fn is_geometric_inconsistency(&self) -> bool {
        matches!(self, SolveError::NonIntersecting { .. })
    }
}

/// Circle intersection for the two fixed anchors.
pub fn solve(
    anchor1: &Point2,
    anchor2: &Point2,
    dist1: f64,
    dist2: f64,
) -> std::result::Result<Point2, SolveError> {
    // Written as negated comparisons so NaN is rejected too.
    if !(dist1 > 0.0) || !(dist2 > 0.0) || !dist1.is_finite() || !dist2.is_finite() {
        return Err(SolveError::NonPositiveDistance { dist1, dist2 });
    }

    let (unit, d) = baseline(anchor1, anchor2).ok_or(SolveError::CoincidentAnchors)?;

    // Signed distance from anchor 1 to the foot of the perpendicular.
    let a = (d * d - dist2 * dist2 + dist1 * dist1) / (2.0 * d);
    let h_squared = dist1 * dist1 - a * a;
    if h_squared < 0.0 {
        return Err(SolveError::NonIntersecting { h_squared });
    }
    let h = h_squared.sqrt();

    let foot = anchor1 + unit * a;
    Ok(foot + perp(&unit) * h)
}

/// Solver bound to the configured anchor layout
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSolver {
    anchor1: Point2,
    anchor2: Point2,
}

impl PositionSolver {
    pub fn new(config: &PositioningConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            anchor1: config.anchor_position(AnchorId::One),
            anchor2: config.anchor_position(AnchorId::Two),
        })
    }

    pub fn anchor(&self, anchor: AnchorId) -> Point2 {
        match anchor {
            AnchorId::One => self.anchor1,
            AnchorId::Two => self.anchor2,
        }
    }

    pub fn solve(&self, dist1: f64, dist2: f64) -> std::result::Result<Point2, SolveError> {
        solve(&self.anchor1, &self.anchor2, dist1, dist2)
    }

    /// Offset of `point` along the chosen perpendicular; never negative for
    /// a solver output.
    pub fn side_offset(&self, point: &Point2) -> f64 {
        match baseline(&self.anchor1, &self.anchor2) {
            Some((unit, _)) => (point - self.anchor1).dot(&perp(&unit)),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn distances(a1: &Point2, a2: &Point2, p: &Point2) -> (f64, f64) {
        ((p - a1).norm(), (p - a2).norm())
    }

    #[test]
    fn test_symmetric_tag() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        let d = 2.0_f64.sqrt();
        let p = solve(&a1, &a2, d, d).unwrap();
        assert_abs_diff_eq!(p.x, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_horizontal_baseline() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        for xi in -6..=10 {
            for yi in 1..=8 {
                let p = Point2::new(xi as f64 * 0.5, yi as f64 * 0.5);
                let (d1, d2) = distances(&a1, &a2, &p);
                let solved = solve(&a1, &a2, d1, d2).unwrap();
                assert_abs_diff_eq!(solved.x, p.x, epsilon = 1e-6);
                assert_abs_diff_eq!(solved.y, p.y, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_round_trip_tilted_baseline() {
        let a1 = Point2::new(1.0, -2.0);
        let a2 = Point2::new(4.0, 2.0);
        let (unit, _) = baseline(&a1, &a2).unwrap();
        let normal = perp(&unit);
        for along in [-1.0, 0.0, 1.5, 2.5, 6.0] {
            for offset in [0.1, 0.75, 3.0] {
                let p = a1 + unit * along + normal * offset;
                let (d1, d2) = distances(&a1, &a2, &p);
                let solved = solve(&a1, &a2, d1, d2).unwrap();
                assert_abs_diff_eq!(solved.x, p.x, epsilon = 1e-6);
                assert_abs_diff_eq!(solved.y, p.y, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_mirror_image_folds_to_positive_side() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        let below = Point2::new(0.5, -1.2);
        let (d1, d2) = distances(&a1, &a2, &below);
        let solved = solve(&a1, &a2, d1, d2).unwrap();
        assert_abs_diff_eq!(solved.x, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(solved.y, 1.2, epsilon = 1e-9);
    }

    #[test]
    fn test_never_negative_side() {
        let config = PositioningConfig {
            anchor1: [3.0, 1.0],
            anchor2: [-1.0, 2.0],
            ..Default::default()
        };
        let solver = PositionSolver::new(&config).unwrap();
        for i in 1..30 {
            for j in 1..30 {
                let d1 = i as f64 * 0.25;
                let d2 = j as f64 * 0.25;
                if let Ok(p) = solver.solve(d1, d2) {
                    assert!(solver.side_offset(&p) >= -1e-12);
                }
            }
        }
    }

    #[test]
    fn test_tangent_circles() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        let p = solve(&a1, &a2, 1.0, 1.0).unwrap();
        assert_abs_diff_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_circles_too_far_apart() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        let err = solve(&a1, &a2, 0.5, 0.7).unwrap_err();
        assert!(matches!(err, SolveError::NonIntersecting { .. }));
        assert!(err.is_geometric_inconsistency());
    }

    #[test]
    fn test_circle_inside_other() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        let err = solve(&a1, &a2, 5.0, 1.0).unwrap_err();
        assert!(matches!(err, SolveError::NonIntersecting { .. }));
        let err = solve(&a1, &a2, 0.5, 3.0).unwrap_err();
        assert!(matches!(err, SolveError::NonIntersecting { .. }));
    }

    #[test]
    fn test_non_positive_distances() {
        let a1 = Point2::new(0.0, 0.0);
        let a2 = Point2::new(2.0, 0.0);
        assert!(matches!(
            solve(&a1, &a2, 0.0, 1.0),
            Err(SolveError::NonPositiveDistance { .. })
        ));
        assert!(matches!(
            solve(&a1, &a2, 1.0, -0.5),
            Err(SolveError::NonPositiveDistance { .. })
        ));
        let err = solve(&a1, &a2, f64::NAN, 1.0).unwrap_err();
        assert!(!err.is_geometric_inconsistency());
    }

    #[test]
    fn test_coincident_anchors() {
        let a = Point2::new(1.0, 1.0);
        assert_eq!(solve(&a, &a, 1.0, 1.0), Err(SolveError::CoincidentAnchors));
    }

    #[test]
    fn test_solver_rejects_invalid_config() {
        let config = PositioningConfig {
            anchor1: [2.0, 0.0],
            anchor2: [2.0, 0.0],
            ..Default::default()
        };
        assert!(PositionSolver::new(&config).is_err());
    }
}
