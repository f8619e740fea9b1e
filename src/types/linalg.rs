//! Planar vector helpers for anchor and tag coordinates.
//!
//! All geometry in the crate works in a local 2D frame measured in meters,
//! so a single nalgebra alias covers anchors, the tag and baseline vectors.

use nalgebra::Vector2;

pub type Point2 = Vector2<f64>;

/// Unit vector pointing from `from` to `to` together with the separation.
/// Returns `None` when the two points coincide.
pub fn baseline(from: &Point2, to: &Point2) -> Option<(Point2, f64)> {
    let delta = to - from;
    let length = delta.norm();
    if length == 0.0 || !length.is_finite() {
        return None;
    }
    Some((delta / length, length))
}

/// Counter-clockwise perpendicular of `v`.
pub fn perp(v: &Point2) -> Point2 {
    Point2::new(-v.y, v.x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_unit_length() {
        let (unit, length) = baseline(&Point2::new(1.0, 1.0), &Point2::new(4.0, 5.0)).unwrap();
        assert!((length - 5.0).abs() < 1e-12);
        assert!((unit.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_baseline_coincident() {
        assert!(baseline(&Point2::new(2.0, 0.0), &Point2::new(2.0, 0.0)).is_none());
    }

    #[test]
    fn test_perp_is_left_turn() {
        let p = perp(&Point2::new(1.0, 0.0));
        assert_eq!(p, Point2::new(0.0, 1.0));
    }
}
