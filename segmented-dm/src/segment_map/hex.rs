//! Hexagonal ring geometry for the vendor's segment numbering.
//!
//! Segment 1 sits at the center of the aperture. Ring `k` holds `6k`
//! segments; its first segment is the corner `k` steps "up" from the center
//! (toward the hardware reference segment) and numbering proceeds
//! counter-clockwise as seen from the front of the mirror:
//!
//! ```text
//!                 8
//!            9         19
//!      10         2         18
//!            3         7
//!      11         1         17
//!            4         6
//!      12         5         16
//!           13        15
//!                14
//! ```
//!
//! Coordinates are axial `(q, r)` on a flat-top hex grid with `r` increasing
//! downward, so the "up" neighbour of any segment is `(q, r - 1)`.

use serde::{Deserialize, Serialize};

/// Axial coordinate of a segment on the hex grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hex {
    pub q: i32,
    pub r: i32,
}

/// Step directions used to walk a ring counter-clockwise from its top corner.
const RING_WALK: [Hex; 6] = [
    Hex { q: -1, r: 1 },
    Hex { q: 0, r: 1 },
    Hex { q: 1, r: 0 },
    Hex { q: 1, r: -1 },
    Hex { q: 0, r: -1 },
    Hex { q: -1, r: 0 },
];

impl Hex {
    /// The central segment.
    pub const CENTER: Hex = Hex { q: 0, r: 0 };

    fn offset(self, direction: Hex, steps: i32) -> Hex {
        Hex {
            q: self.q + direction.q * steps,
            r: self.r + direction.r * steps,
        }
    }

    /// Number of segment-to-segment steps between two positions.
    pub fn distance(self, other: Hex) -> u32 {
        let dq = self.q - other.q;
        let dr = self.r - other.r;
        ((dq.abs() + dr.abs() + (dq + dr).abs()) / 2) as u32
    }

    /// Ring index of this position (0 for the center).
    pub fn ring(self) -> u32 {
        self.distance(Hex::CENTER)
    }
}

/// Number of segments in a full aperture of `rings` rings around the center.
///
/// A 37-segment mirror is three full rings.
pub fn segments_in_rings(rings: u32) -> u32 {
    3 * rings * (rings + 1) + 1
}

/// Grid position of a segment in the vendor numbering (1-based).
///
/// Returns `None` for segment 0, which does not exist.
pub fn segment_position(segment: u32) -> Option<Hex> {
    if segment == 0 {
        return None;
    }
    if segment == 1 {
        return Some(Hex::CENTER);
    }

    let segment = u64::from(segment);
    let mut ring: u64 = 1;
    while 3 * ring * (ring + 1) + 1 < segment {
        ring += 1;
    }

    let first_in_ring = 3 * ring * (ring - 1) + 2;
    let offset = segment - first_in_ring;
    let side = (offset / ring) as usize;
    let step = (offset % ring) as i32;
    let k = ring as i32;

    let mut hex = Hex { q: 0, r: -k };
    for direction in &RING_WALK[..side] {
        hex = hex.offset(*direction, k);
    }
    Some(hex.offset(RING_WALK[side], step))
}

/// Physical segment dimensions, used to place segments in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentGeometry {
    /// Flat-to-flat width of one segment in meters
    pub flat_to_flat_m: f64,
    /// Gap between neighbouring segments in meters
    pub gap_m: f64,
}

impl SegmentGeometry {
    /// Center-to-center distance between neighbouring segments.
    pub fn pitch_m(&self) -> f64 {
        self.flat_to_flat_m + self.gap_m
    }

    /// Center of a grid position in meters, `+y` pointing "up".
    pub fn center_of(&self, hex: Hex) -> (f64, f64) {
        let pitch = self.pitch_m();
        let x = pitch * (3f64.sqrt() / 2.0) * f64::from(hex.q);
        let y_down = pitch * (f64::from(hex.r) + f64::from(hex.q) / 2.0);
        (x, -y_down)
    }
}
