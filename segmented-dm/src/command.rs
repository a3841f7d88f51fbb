//! Canonical piston-tip-tilt command.
//!
//! A [`Command`] maps segment ids to [`Ptt`] triples in the units named by its
//! [`PttUnits`] tag. Segments that are not present are unused; they are
//! resolved to the flat value when the command is written to the device.
//!
//! Commands are immutable. Every editing operation returns a new instance.

use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::segment_map::{SegmentId, SegmentMap};
use crate::units::PttUnits;

/// Piston, tip and tilt of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ptt {
    pub piston: f64,
    pub tip: f64,
    pub tilt: f64,
}

impl Ptt {
    pub const ZERO: Ptt = Ptt {
        piston: 0.0,
        tip: 0.0,
        tilt: 0.0,
    };

    pub fn new(piston: f64, tip: f64, tilt: f64) -> Self {
        Self { piston, tip, tilt }
    }

    pub fn is_zero(&self) -> bool {
        self.piston == 0.0 && self.tip == 0.0 && self.tilt == 0.0
    }

    /// Convert from `units` to device units (µm, mrad).
    pub fn to_device_units(self, units: PttUnits) -> Ptt {
        Ptt {
            piston: units.piston.to_micrometers(self.piston),
            tip: units.tilt.to_milliradians(self.tip),
            tilt: units.tilt.to_milliradians(self.tilt),
        }
    }
}

impl Add for Ptt {
    type Output = Ptt;

    fn add(self, rhs: Ptt) -> Ptt {
        Ptt {
            piston: self.piston + rhs.piston,
            tip: self.tip + rhs.tip,
            tilt: self.tilt + rhs.tilt,
        }
    }
}

impl From<(f64, f64, f64)> for Ptt {
    fn from((piston, tip, tilt): (f64, f64, f64)) -> Self {
        Self { piston, tip, tilt }
    }
}

/// Format-agnostic PTT command for a pupil.
///
/// Entries are kept sorted by segment id so equality does not depend on the
/// order a source listed them in. Duplicate entries are kept rather than
/// merged; the validator rejects them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    units: PttUnits,
    segments: Vec<(SegmentId, Ptt)>,
}

impl Command {
    pub fn new(units: PttUnits, entries: impl IntoIterator<Item = (SegmentId, Ptt)>) -> Self {
        let mut segments: Vec<_> = entries.into_iter().collect();
        segments.sort_by_key(|(segment, _)| *segment);
        Self { units, segments }
    }

    /// Command already in device units.
    pub fn device(entries: impl IntoIterator<Item = (SegmentId, Ptt)>) -> Self {
        Self::new(PttUnits::DEVICE, entries)
    }

    /// Zero on every enabled pupil segment.
    pub fn zeros(map: &SegmentMap) -> Self {
        Self::device(map.enabled_segments().map(|s| (s, Ptt::ZERO)))
    }

    pub fn units(&self) -> PttUnits {
        self.units
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Value for a segment, or `None` if the segment is unused.
    pub fn get(&self, segment: SegmentId) -> Option<Ptt> {
        self.segments
            .binary_search_by_key(&segment, |(s, _)| *s)
            .ok()
            .map(|i| self.segments[i].1)
    }

    pub fn contains(&self, segment: SegmentId) -> bool {
        self.get(segment).is_some()
    }

    /// Entries in segment id order.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, Ptt)> + '_ {
        self.segments.iter().copied()
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segments.iter().map(|(s, _)| *s)
    }

    /// Same command expressed in device units (µm, mrad).
    pub fn to_device_units(&self) -> Command {
        if self.units.is_device() {
            return self.clone();
        }
        let units = self.units;
        Command::device(self.iter().map(|(s, ptt)| (s, ptt.to_device_units(units))))
    }

    /// New command with one segment set to `ptt`, replacing any previous value.
    pub fn with_segment(&self, segment: SegmentId, ptt: Ptt) -> Command {
        let entries = self
            .iter()
            .filter(|(s, _)| *s != segment)
            .chain(std::iter::once((segment, ptt)));
        Command::new(self.units, entries)
    }

    /// Per-segment sum of two commands, in device units.
    ///
    /// Segments present in only one command keep that command's value. Used to
    /// express a command relative to a custom flat.
    pub fn offset_by(&self, other: &Command) -> Command {
        let base = self.to_device_units();
        let offset = other.to_device_units();

        let mut entries: Vec<(SegmentId, Ptt)> = base
            .iter()
            .map(|(s, ptt)| (s, ptt + offset.get(s).unwrap_or(Ptt::ZERO)))
            .collect();
        entries.extend(offset.iter().filter(|(s, _)| !base.contains(*s)));
        Command::device(entries)
    }

    /// The full-pupil command the device will actually hold.
    ///
    /// Every enabled pupil segment gets an explicit value in device units;
    /// unused segments take their value from `flat` (or zero when the flat
    /// does not cover them). Disabled segments and segments outside the pupil
    /// are left out.
    pub fn resolved(&self, map: &SegmentMap, flat: &Command) -> Command {
        let command = self.to_device_units();
        let flat = flat.to_device_units();
        Command::device(map.enabled_segments().map(|s| {
            let ptt = command
                .get(s)
                .or_else(|| flat.get(s))
                .unwrap_or(Ptt::ZERO);
            (s, ptt)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{PistonUnit, TiltUnit};
    use approx::assert_relative_eq;

    fn map() -> SegmentMap {
        let pupil = [3, 9, 10, 11, 4, 1, 2].into_iter().map(SegmentId).collect();
        SegmentMap::new(37, pupil, None).unwrap()
    }

    #[test]
    fn test_entries_sorted_by_segment() {
        let command = Command::device([
            (SegmentId(9), Ptt::new(1.0, 0.0, 0.0)),
            (SegmentId(3), Ptt::new(2.0, 0.0, 0.0)),
        ]);
        let ids: Vec<_> = command.segment_ids().collect();
        assert_eq!(ids, vec![SegmentId(3), SegmentId(9)]);
        assert_eq!(command.get(SegmentId(3)), Some(Ptt::new(2.0, 0.0, 0.0)));
        assert_eq!(command.get(SegmentId(4)), None);
    }

    #[test]
    fn test_equality_ignores_source_order() {
        let a = Command::device([
            (SegmentId(1), Ptt::new(0.1, 0.2, 0.3)),
            (SegmentId(2), Ptt::ZERO),
        ]);
        let b = Command::device([
            (SegmentId(2), Ptt::ZERO),
            (SegmentId(1), Ptt::new(0.1, 0.2, 0.3)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_zeros_skips_disabled() {
        let map = map().with_disabled([SegmentId(10)]).unwrap();
        let zeros = Command::zeros(&map);
        assert_eq!(zeros.len(), 6);
        assert!(!zeros.contains(SegmentId(10)));
        assert!(zeros.iter().all(|(_, ptt)| ptt.is_zero()));
    }

    #[test]
    fn test_to_device_units() {
        let units = PttUnits {
            piston: PistonUnit::Nanometers,
            tilt: TiltUnit::Microradians,
        };
        let command = Command::new(units, [(SegmentId(1), Ptt::new(500.0, 20.0, -40.0))]);
        let device = command.to_device_units();

        assert!(device.units().is_device());
        let ptt = device.get(SegmentId(1)).unwrap();
        assert_relative_eq!(ptt.piston, 0.5);
        assert_relative_eq!(ptt.tip, 0.02);
        assert_relative_eq!(ptt.tilt, -0.04);
    }

    #[test]
    fn test_with_segment_replaces_value() {
        let command = Command::device([(SegmentId(1), Ptt::new(1.0, 0.0, 0.0))]);
        let edited = command.with_segment(SegmentId(1), Ptt::new(0.0, 2.0, 0.0));

        assert_eq!(edited.len(), 1);
        assert_eq!(edited.get(SegmentId(1)), Some(Ptt::new(0.0, 2.0, 0.0)));
        // Original untouched
        assert_eq!(command.get(SegmentId(1)), Some(Ptt::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_offset_by_sums_overlapping_segments() {
        let command = Command::device([
            (SegmentId(1), Ptt::new(1.0, 0.5, 0.0)),
            (SegmentId(2), Ptt::new(0.0, 0.0, 1.0)),
        ]);
        let flat = Command::device([
            (SegmentId(1), Ptt::new(0.25, 0.0, 0.0)),
            (SegmentId(3), Ptt::new(0.0, 0.1, 0.0)),
        ]);
        let combined = command.offset_by(&flat);

        assert_eq!(combined.get(SegmentId(1)), Some(Ptt::new(1.25, 0.5, 0.0)));
        assert_eq!(combined.get(SegmentId(2)), Some(Ptt::new(0.0, 0.0, 1.0)));
        assert_eq!(combined.get(SegmentId(3)), Some(Ptt::new(0.0, 0.1, 0.0)));
    }

    #[test]
    fn test_resolved_fills_from_flat() {
        let map = map().with_disabled([SegmentId(10)]).unwrap();
        let flat = Command::device([(SegmentId(9), Ptt::new(0.2, 0.0, 0.0))]);
        let command = Command::device([(SegmentId(3), Ptt::new(1.0, 0.0, 0.0))]);

        let resolved = command.resolved(&map, &flat);
        assert_eq!(resolved.len(), 6);
        assert_eq!(resolved.get(SegmentId(3)), Some(Ptt::new(1.0, 0.0, 0.0)));
        assert_eq!(resolved.get(SegmentId(9)), Some(Ptt::new(0.2, 0.0, 0.0)));
        assert_eq!(resolved.get(SegmentId(11)), Some(Ptt::ZERO));
        assert_eq!(resolved.get(SegmentId(10)), None);
    }
}
