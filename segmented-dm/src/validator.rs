//! Hardware limit checks applied before any command reaches the device.
//!
//! Validation is pure: it never touches the device and never changes the
//! command. Out-of-range values are reported, never clamped.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{Command, Ptt};
use crate::segment_map::{SegmentId, SegmentMap};

/// Degree of freedom of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PttAxis {
    Piston,
    Tip,
    Tilt,
}

/// Which end of a travel range was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Bound {
    #[strum(to_string = "minimum")]
    Min,
    #[strum(to_string = "maximum")]
    Max,
}

/// Inclusive travel range of one axis, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelRange {
    pub min: f64,
    pub max: f64,
}

impl TravelRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Symmetric range `[-half_width, half_width]`.
    pub const fn symmetric(half_width: f64) -> Self {
        Self {
            min: -half_width,
            max: half_width,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// The bound `value` violates, if any.
    pub fn violated_bound(&self, value: f64) -> Option<(Bound, f64)> {
        if value < self.min {
            Some((Bound::Min, self.min))
        } else if value > self.max {
            Some((Bound::Max, self.max))
        } else {
            None
        }
    }
}

/// Travel limits for every segment, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelLimits {
    /// Piston range in µm
    pub piston_um: TravelRange,
    /// Tip range in mrad
    pub tip_mrad: TravelRange,
    /// Tilt range in mrad
    pub tilt_mrad: TravelRange,
}

impl Default for TravelLimits {
    /// Stroke of a PTT111-class mirror: ±2.5 µm piston, ±4 mrad tip/tilt.
    fn default() -> Self {
        Self {
            piston_um: TravelRange::symmetric(2.5),
            tip_mrad: TravelRange::symmetric(4.0),
            tilt_mrad: TravelRange::symmetric(4.0),
        }
    }
}

impl TravelLimits {
    fn range(&self, axis: PttAxis) -> &TravelRange {
        match axis {
            PttAxis::Piston => &self.piston_um,
            PttAxis::Tip => &self.tip_mrad,
            PttAxis::Tilt => &self.tilt_mrad,
        }
    }

    /// Check one segment's device-unit values against the limits.
    pub fn check(&self, segment: SegmentId, ptt: Ptt) -> Result<(), ValidationError> {
        for (axis, value) in [
            (PttAxis::Piston, ptt.piston),
            (PttAxis::Tip, ptt.tip),
            (PttAxis::Tilt, ptt.tilt),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite { segment, axis });
            }
            if let Some((bound, limit)) = self.range(axis).violated_bound(value) {
                return Err(ValidationError::OutOfRange {
                    segment,
                    axis,
                    value,
                    bound,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// A command that must not be sent to the mirror.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("segment {segment} {axis} = {value} exceeds the {bound} travel of {limit}")]
    OutOfRange {
        segment: SegmentId,
        axis: PttAxis,
        value: f64,
        bound: Bound,
        limit: f64,
    },

    #[error("segment {segment} {axis} is not a finite number")]
    NonFinite { segment: SegmentId, axis: PttAxis },

    #[error("unknown segment {0}: not part of the pupil")]
    UnknownSegment(SegmentId),

    #[error("segment {0} appears more than once in the command")]
    DuplicateSegment(SegmentId),

    #[error("segment {0} is disabled and cannot be commanded")]
    SegmentDisabled(SegmentId),
}

/// Check a command against the pupil and the travel limits.
///
/// Values are compared in device units; the returned command keeps its
/// original unit tag.
pub fn validate(
    command: Command,
    segment_map: &SegmentMap,
    limits: &TravelLimits,
) -> Result<Command, ValidationError> {
    let units = command.units();
    let mut seen = BTreeSet::new();

    for (segment, ptt) in command.iter() {
        if !seen.insert(segment) {
            return Err(ValidationError::DuplicateSegment(segment));
        }
        segment_map
            .to_driver_channel(segment)
            .map_err(|_| ValidationError::UnknownSegment(segment))?;
        if !segment_map.is_enabled(segment) {
            return Err(ValidationError::SegmentDisabled(segment));
        }
        limits.check(segment, ptt.to_device_units(units))?;
    }

    Ok(command)
}
