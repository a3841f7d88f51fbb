//! Dense `(n, 3)` arrays produced by optical simulation models.
//!
//! Each row holds one segment's (piston, tip, tilt) in SI units: meters of
//! piston and radians of tip/tilt, or meters of edge displacement across the
//! segment when [`TiltConvention::EdgeDisplacement`] is selected. Row order
//! is either the pupil order or the full aperture in vendor numbering.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommandFormat, ParseError};
use crate::command::{Command, Ptt};
use crate::segment_map::hex::SegmentGeometry;
use crate::segment_map::{MapError, SegmentId, SegmentMap};

/// Micrometers per meter.
const UM_PER_M: f64 = 1e6;

/// Milliradians per radian.
const MRAD_PER_RAD: f64 = 1e3;

/// How array rows are assigned to segments.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SimulationOrdering {
    /// Row `i` is `segments_used[i]`.
    #[default]
    Pupil,
    /// Row `i` is segment `i + 1` of the whole mirror.
    FullAperture,
}

/// What to do with a non-zero row that falls outside the pupil.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutOfPupilPolicy {
    Drop,
    #[default]
    Fail,
}

/// Meaning of the tip and tilt columns.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TiltConvention {
    /// Angles in radians.
    #[default]
    Radians,
    /// Meters of displacement from one flat edge of the segment to the other.
    EdgeDisplacement,
}

/// Settings for the simulation-array adapter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    pub ordering: SimulationOrdering,
    pub out_of_pupil: OutOfPupilPolicy,
    pub tilt_convention: TiltConvention,
    pub geometry: Option<SegmentGeometry>,
}

/// Adapter for simulation arrays.
#[derive(Debug, Clone)]
pub struct SimulationArrayFormat {
    map: SegmentMap,
    options: SimulationOptions,
}

impl SimulationArrayFormat {
    pub fn new(map: SegmentMap, options: SimulationOptions) -> Self {
        Self { map, options }
    }

    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    fn tilt_scale(&self) -> Result<f64, ParseError> {
        match self.options.tilt_convention {
            TiltConvention::Radians => Ok(MRAD_PER_RAD),
            TiltConvention::EdgeDisplacement => {
                let geometry = self.options.geometry.ok_or(ParseError::MissingGeometry)?;
                Ok(MRAD_PER_RAD / geometry.flat_to_flat_m)
            }
        }
    }

    /// Parse a borrowed `(n, 3)` array.
    pub fn parse_view(&self, array: ArrayView2<'_, f64>) -> Result<Command, ParseError> {
        let (rows, cols) = array.dim();
        if cols != 3 {
            return Err(ParseError::Shape {
                rows,
                cols,
                expected: "(n, 3)".to_string(),
            });
        }

        let pupil = self.map.pupil_segments();
        match self.options.ordering {
            SimulationOrdering::Pupil if rows != pupil.len() => {
                return Err(ParseError::Shape {
                    rows,
                    cols,
                    expected: format!("({}, 3)", pupil.len()),
                });
            }
            SimulationOrdering::FullAperture if rows > self.map.total_segments() as usize => {
                return Err(ParseError::Shape {
                    rows,
                    cols,
                    expected: format!("at most ({}, 3)", self.map.total_segments()),
                });
            }
            _ => {}
        }

        let tilt_scale = self.tilt_scale()?;
        let mut entries = Vec::with_capacity(pupil.len());
        let mut dropped = 0usize;

        for (i, row) in array.outer_iter().enumerate() {
            let segment = match self.options.ordering {
                SimulationOrdering::Pupil => pupil[i],
                SimulationOrdering::FullAperture => SegmentId(i as u32 + 1),
            };
            let is_zero = row.iter().all(|v| *v == 0.0);

            if !self.map.contains(segment) {
                if is_zero {
                    continue;
                }
                match self.options.out_of_pupil {
                    OutOfPupilPolicy::Drop => {
                        dropped += 1;
                        continue;
                    }
                    OutOfPupilPolicy::Fail => {
                        return Err(MapError::UnknownSegment(segment).into());
                    }
                }
            }
            if is_zero && !self.map.is_enabled(segment) {
                continue;
            }

            let ptt = Ptt::new(
                row[0] * UM_PER_M,
                row[1] * tilt_scale,
                row[2] * tilt_scale,
            );
            entries.push((segment, ptt));
        }

        if dropped > 0 {
            debug!("Dropped {dropped} non-zero rows outside the pupil");
        }
        Ok(Command::device(entries))
    }
}

impl CommandFormat for SimulationArrayFormat {
    type Input = Array2<f64>;

    fn parse(&self, input: &Array2<f64>) -> Result<Command, ParseError> {
        self.parse_view(input.view())
    }
}
