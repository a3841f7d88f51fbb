//! Segment numbering and driver channel mapping for one mirror unit.
//!
//! A [`SegmentMap`] is built once per hardware unit from configuration and
//! never changes afterwards, so it can be shared across threads freely.
//!
//! Three numbering conventions meet here:
//!
//! - **Segment ids** ([`SegmentId`]): the vendor's 1-based, center-out ring
//!   numbering of the full aperture (see [`hex`]). GUI exports and canonical
//!   commands are keyed by these.
//! - **Driver channels** ([`DriverChannel`]): the identifiers the driver
//!   electronics use in the device-native command file.
//! - **Pupil order**: the position of a segment in `pupil_segments`, which is
//!   the order records are written to the device and the order simulation
//!   arrays use by default.
//!
//! The pupil order is authoritative input data. The ring geometry is only used
//! to check that the supplied order starts at the pupil center and works
//! outward.

pub mod hex;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::hex::{segment_position, Hex, SegmentGeometry};

/// Vendor segment number (1-based).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Channel identifier used by the driver electronics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DriverChannel(pub u32);

impl fmt::Display for DriverChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors from building or querying a [`SegmentMap`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// Segment is not part of this pupil.
    #[error("unknown segment {0}: not part of the pupil")]
    UnknownSegment(SegmentId),

    /// No pupil segment is wired to this driver channel.
    #[error("unknown driver channel {0}")]
    UnknownChannel(DriverChannel),

    #[error("pupil must contain at least one segment")]
    EmptyPupil,

    #[error("pupil has {pupil} segments but the mirror only has {total}")]
    TooManySegments { pupil: usize, total: u32 },

    #[error("segment {segment} is outside the mirror's 1..={total} range")]
    OutOfRange { segment: SegmentId, total: u32 },

    #[error("segment {0} is listed more than once in the pupil")]
    DuplicateSegment(SegmentId),

    #[error("driver channel {0} is assigned to more than one segment")]
    DuplicateChannel(DriverChannel),

    #[error("{segments} pupil segments but {channels} driver channels")]
    ChannelCountMismatch { segments: usize, channels: usize },

    /// Pupil order steps back toward the center.
    #[error(
        "segment {segment} is {distance} rings from the pupil center but follows a segment {previous} rings out"
    )]
    NotCenterOut {
        segment: SegmentId,
        distance: u32,
        previous: u32,
    },
}

/// Immutable mapping between pupil segments and driver channels.
#[derive(Debug, Clone)]
pub struct SegmentMap {
    total_segments: u32,
    pupil_segments: Vec<SegmentId>,
    logical_to_driver: HashMap<SegmentId, DriverChannel>,
    driver_to_logical: HashMap<DriverChannel, SegmentId>,
    disabled: BTreeSet<SegmentId>,
}

impl SegmentMap {
    /// Build a map for a mirror with `total_segments` segments.
    ///
    /// `pupil_segments` lists the populated segments, center first, in
    /// center-out order. `driver_channels`, when given, is parallel to
    /// `pupil_segments`; otherwise each segment drives the channel with the
    /// same number.
    pub fn new(
        total_segments: u32,
        pupil_segments: Vec<SegmentId>,
        driver_channels: Option<Vec<DriverChannel>>,
    ) -> Result<Self, MapError> {
        if pupil_segments.is_empty() {
            return Err(MapError::EmptyPupil);
        }
        if pupil_segments.len() > total_segments as usize {
            return Err(MapError::TooManySegments {
                pupil: pupil_segments.len(),
                total: total_segments,
            });
        }

        let channels = match driver_channels {
            Some(channels) if channels.len() != pupil_segments.len() => {
                return Err(MapError::ChannelCountMismatch {
                    segments: pupil_segments.len(),
                    channels: channels.len(),
                });
            }
            Some(channels) => channels,
            None => pupil_segments.iter().map(|s| DriverChannel(s.0)).collect(),
        };

        let mut logical_to_driver = HashMap::with_capacity(pupil_segments.len());
        let mut driver_to_logical = HashMap::with_capacity(pupil_segments.len());
        for (&segment, &channel) in pupil_segments.iter().zip(&channels) {
            if segment.0 == 0 || segment.0 > total_segments {
                return Err(MapError::OutOfRange {
                    segment,
                    total: total_segments,
                });
            }
            if logical_to_driver.insert(segment, channel).is_some() {
                return Err(MapError::DuplicateSegment(segment));
            }
            if driver_to_logical.insert(channel, segment).is_some() {
                return Err(MapError::DuplicateChannel(channel));
            }
        }

        check_center_out(&pupil_segments)?;

        Ok(Self {
            total_segments,
            pupil_segments,
            logical_to_driver,
            driver_to_logical,
            disabled: BTreeSet::new(),
        })
    }

    /// Mark segments as disabled in hardware.
    ///
    /// Disabled segments stay in the pupil (the device file is positional) but
    /// may not be commanded.
    pub fn with_disabled(
        mut self,
        disabled: impl IntoIterator<Item = SegmentId>,
    ) -> Result<Self, MapError> {
        for segment in disabled {
            if !self.contains(segment) {
                return Err(MapError::UnknownSegment(segment));
            }
            self.disabled.insert(segment);
        }
        Ok(self)
    }

    /// Total number of segments on the mirror.
    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    /// Populated segments in pupil order, center first.
    pub fn pupil_segments(&self) -> &[SegmentId] {
        &self.pupil_segments
    }

    /// Number of pupil segments.
    pub fn len(&self) -> usize {
        self.pupil_segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pupil_segments.is_empty()
    }

    /// The segment at the center of the pupil.
    pub fn center(&self) -> SegmentId {
        self.pupil_segments[0]
    }

    pub fn contains(&self, segment: SegmentId) -> bool {
        self.logical_to_driver.contains_key(&segment)
    }

    /// Driver channel wired to a pupil segment.
    pub fn to_driver_channel(&self, segment: SegmentId) -> Result<DriverChannel, MapError> {
        self.logical_to_driver
            .get(&segment)
            .copied()
            .ok_or(MapError::UnknownSegment(segment))
    }

    /// Pupil segment wired to a driver channel.
    pub fn from_driver_channel(&self, channel: DriverChannel) -> Result<SegmentId, MapError> {
        self.driver_to_logical
            .get(&channel)
            .copied()
            .ok_or(MapError::UnknownChannel(channel))
    }

    /// `(segment, channel)` pairs in pupil order.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, DriverChannel)> + '_ {
        self.pupil_segments
            .iter()
            .filter_map(|s| self.logical_to_driver.get(s).map(|c| (*s, *c)))
    }

    /// Whether a pupil segment may be commanded. Unknown segments are not enabled.
    pub fn is_enabled(&self, segment: SegmentId) -> bool {
        self.contains(segment) && !self.disabled.contains(&segment)
    }

    pub fn disabled_segments(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.disabled.iter().copied()
    }

    /// Pupil segments that may be commanded, in pupil order.
    pub fn enabled_segments(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.pupil_segments
            .iter()
            .copied()
            .filter(|s| !self.disabled.contains(s))
    }

    /// Position of a segment in the pupil order.
    pub fn pupil_index(&self, segment: SegmentId) -> Option<usize> {
        self.pupil_segments.iter().position(|s| *s == segment)
    }

    /// Rings between a segment and the pupil center.
    pub fn ring_from_center(&self, segment: SegmentId) -> Option<u32> {
        let center = segment_position(self.center().0)?;
        segment_position(segment.0).map(|hex| hex.distance(center))
    }

    /// Physical center of a segment relative to the pupil center, in meters.
    pub fn segment_center(
        &self,
        segment: SegmentId,
        geometry: &SegmentGeometry,
    ) -> Option<(f64, f64)> {
        let center = segment_position(self.center().0)?;
        let hex = segment_position(segment.0)?;
        Some(geometry.center_of(Hex {
            q: hex.q - center.q,
            r: hex.r - center.r,
        }))
    }
}

/// Every segment must be at least as far from the pupil center as the one before it.
fn check_center_out(pupil_segments: &[SegmentId]) -> Result<(), MapError> {
    let mut positions = pupil_segments
        .iter()
        .map(|s| segment_position(s.0).map(|hex| (*s, hex)));
    let Some(Some((_, center))) = positions.next() else {
        return Ok(());
    };

    let mut previous = 0;
    for (segment, hex) in positions.flatten() {
        let distance = hex.distance(center);
        if distance < previous {
            return Err(MapError::NotCenterOut {
                segment,
                distance,
                previous,
            });
        }
        previous = distance;
    }
    Ok(())
}
