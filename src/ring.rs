//! Cyclic position math for rotary encoders.
//!
//! Servo encoders report ticks on a ring of [`RING_SIZE`] positions where
//! tick 4095 and tick 0 are adjacent. A joint's usable arc is described by
//! three calibrated points: `left`, `right` and `center`. The center decides
//! which of the two arcs between `left` and `right` is the calibrated path,
//! so two joints with identical `(left, right)` but different centers can
//! have opposite wrap classification. This is what lets an arc straddle the
//! encoder's zero tick.

use crate::config::RING_SIZE;

/// The calibrated path from `left` to `right` through `center`.
///
/// Derived on demand from a calibration record; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathDescriptor {
    /// Length of the arc in ticks.
    pub total_range: u16,
    /// +1 if raw values grow walking left → right along the arc, -1 if they
    /// shrink.
    pub direction: i8,
    /// Whether the arc crosses the 4095 ↔ 0 boundary.
    pub wraps: bool,
}

/// Compute the path from `left` to `right` passing through `center`.
pub fn path(left: u16, right: u16, center: u16) -> PathDescriptor {
    let (l, r, c) = (left as i32, right as i32, center as i32);
    let ring = RING_SIZE as i32;

    // Does the direct (non-wrapping) arc between left and right contain the
    // center?
    let direct_contains_center = if l <= r {
        l <= c && c <= r
    } else {
        r <= c && c <= l
    };

    if direct_contains_center {
        if l <= r {
            PathDescriptor {
                total_range: (r - l) as u16,
                direction: 1,
                wraps: false,
            }
        } else {
            PathDescriptor {
                total_range: (l - r) as u16,
                direction: -1,
                wraps: false,
            }
        }
    } else if l <= r {
        // The arc runs left → 0 → right the long way round, decreasing.
        PathDescriptor {
            total_range: (l + (ring - r)) as u16,
            direction: -1,
            wraps: true,
        }
    } else {
        // The arc runs left → 4095 → 0 → right, increasing.
        PathDescriptor {
            total_range: ((ring - l) + r) as u16,
            direction: 1,
            wraps: true,
        }
    }
}

/// Convert a raw encoder tick to `[0.0, 1.0]` along the calibrated arc.
///
/// `left` maps to exactly 0.0 and `right` to exactly 1.0; positions outside
/// the arc clamp. A degenerate calibration (zero-length arc) returns 0.5.
pub fn normalize(raw: u16, left: u16, right: u16, center: u16) -> f64 {
    let p = path(left, right, center);
    if p.total_range == 0 {
        return 0.5;
    }

    let (raw, l) = (raw as i32, left as i32);
    let ring = RING_SIZE as i32;

    // Signed distance from left to raw, walking in the path direction.
    let distance = if !p.wraps {
        if p.direction == 1 {
            raw - l
        } else {
            l - raw
        }
    } else if p.direction == 1 {
        // left → 4095 → 0 → right
        if raw >= l {
            raw - l
        } else {
            (ring - l) + raw
        }
    } else {
        // left → 0 → 4095 → right
        if raw <= l {
            l - raw
        } else {
            l + (ring - raw)
        }
    };

    (distance as f64 / p.total_range as f64).clamp(0.0, 1.0)
}

/// Convert a normalized value in `[0.0, 1.0]` back to a raw encoder tick.
///
/// Inverse of [`normalize`] up to integer rounding: the round trip stays
/// within `1 / total_range` of the input. Out-of-range inputs clamp first.
pub fn denormalize(value: f64, left: u16, right: u16, center: u16) -> u16 {
    let value = value.clamp(0.0, 1.0);
    let p = path(left, right, center);
    if p.total_range == 0 {
        return left % RING_SIZE;
    }

    let distance = (value * p.total_range as f64).round() as i32;
    let raw = left as i32 + p.direction as i32 * distance;
    raw.rem_euclid(RING_SIZE as i32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_increasing() {
        let p = path(1000, 3000, 2000);
        assert_eq!(
            p,
            PathDescriptor {
                total_range: 2000,
                direction: 1,
                wraps: false
            }
        );
        assert_eq!(normalize(2000, 1000, 3000, 2000), 0.5);
    }

    #[test]
    fn test_direct_decreasing() {
        let p = path(3000, 1000, 2000);
        assert_eq!(
            p,
            PathDescriptor {
                total_range: 2000,
                direction: -1,
                wraps: false
            }
        );
        assert_eq!(normalize(3000, 3000, 1000, 2000), 0.0);
        assert_eq!(normalize(1000, 3000, 1000, 2000), 1.0);
    }

    #[test]
    fn test_wrap_decreasing() {
        // left < right but the center sits on the arc through zero.
        let p = path(100, 4000, 50);
        assert_eq!(
            p,
            PathDescriptor {
                total_range: 196,
                direction: -1,
                wraps: true
            }
        );
        let n = normalize(0, 100, 4000, 50);
        assert!((n - 100.0 / 196.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_increasing() {
        let p = path(4000, 100, 4050);
        assert_eq!(
            p,
            PathDescriptor {
                total_range: 196,
                direction: 1,
                wraps: true
            }
        );
        let n = normalize(4050, 4000, 100, 4050);
        assert!((n - 50.0 / 196.0).abs() < 1e-9);
    }

    #[test]
    fn test_center_flips_wrap_classification() {
        // Identical (left, right), opposite centers → opposite wrap class.
        assert!(!path(100, 4000, 2000).wraps);
        assert!(path(100, 4000, 50).wraps);
        assert!(!path(4000, 100, 2000).wraps);
        assert!(path(4000, 100, 4050).wraps);
    }

    #[test]
    fn test_endpoints_exact() {
        for (l, r, c) in [
            (1000u16, 3000u16, 2000u16),
            (3000, 1000, 2000),
            (100, 4000, 50),
            (4000, 100, 4050),
        ] {
            assert_eq!(normalize(l, l, r, c), 0.0, "left of ({l},{r},{c})");
            assert_eq!(normalize(r, l, r, c), 1.0, "right of ({l},{r},{c})");
            assert_eq!(denormalize(0.0, l, r, c), l);
            assert_eq!(denormalize(1.0, l, r, c), r);
        }
    }

    #[test]
    fn test_round_trip_within_one_tick() {
        let cases = [
            (1000u16, 3000u16, 2000u16),
            (3000, 1000, 2000),
            (100, 4000, 50),
            (4000, 100, 4050),
            (0, 4095, 2048),
        ];
        for (l, r, c) in cases {
            let total = path(l, r, c).total_range as f64;
            for i in 0..=100 {
                let v = i as f64 / 100.0;
                let raw = denormalize(v, l, r, c);
                let back = normalize(raw, l, r, c);
                assert!(
                    (back - v).abs() <= 1.0 / total + 1e-9,
                    "({l},{r},{c}) v={v} raw={raw} back={back}"
                );
            }
        }
    }

    #[test]
    fn test_degenerate_range() {
        assert_eq!(normalize(123, 500, 500, 500), 0.5);
        assert_eq!(denormalize(0.7, 500, 500, 500), 500);
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(normalize(500, 1000, 3000, 2000), 0.0);
        assert_eq!(normalize(3500, 1000, 3000, 2000), 1.0);
        assert_eq!(denormalize(-0.5, 1000, 3000, 2000), 1000);
        assert_eq!(denormalize(1.5, 1000, 3000, 2000), 3000);
    }
}
