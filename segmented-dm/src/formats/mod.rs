//! Input adapters that turn each source representation into a [`Command`].
//!
//! Three sources feed the pipeline:
//!
//! - [`gui_export`]: record lists saved by the vendor GUI
//! - [`device_native`]: the INI-style file the driver executable consumes
//! - [`simulation`]: `(n, 3)` arrays produced by optical models
//!
//! Adapters only translate. They reject segments the [`SegmentMap`] does not
//! know about but never enforce travel limits; that is the validator's job.
//!
//! [`SegmentMap`]: crate::segment_map::SegmentMap

pub mod device_native;
pub mod gui_export;
pub mod simulation;

use ndarray::ArrayView2;
use thiserror::Error;

use crate::command::Command;
use crate::segment_map::{DriverChannel, MapError, SegmentId};

pub use device_native::{DeviceNativeFormat, NativeHeader, NativeRecord, NativeRecordSet};
pub use gui_export::GuiExportFormat;
pub use simulation::{
    OutOfPupilPolicy, SimulationArrayFormat, SimulationOptions, SimulationOrdering,
    TiltConvention,
};

/// Errors raised while parsing a command source.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Segment or channel lookup failed.
    #[error(transparent)]
    Map(#[from] MapError),

    /// Line could not be understood.
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("segment {0} appears more than once")]
    DuplicateSegment(SegmentId),

    #[error("driver channel {0} appears more than once")]
    DuplicateChannel(DriverChannel),

    /// Header record count disagrees with the records present.
    #[error("header declares {declared} segments but {found} records were found")]
    SegmentCount { declared: usize, found: usize },

    /// Array has the wrong dimensions.
    #[error("array shape ({rows}, {cols}) does not match expected {expected}")]
    Shape {
        rows: usize,
        cols: usize,
        expected: String,
    },

    /// Edge-displacement tilt needs the segment size.
    #[error("edge-displacement tilt requires segment geometry")]
    MissingGeometry,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            line,
            reason: reason.into(),
        }
    }

    /// Segment the error refers to, if it is an unknown-segment miss.
    pub fn unknown_segment(&self) -> Option<SegmentId> {
        match self {
            ParseError::Map(MapError::UnknownSegment(segment)) => Some(*segment),
            _ => None,
        }
    }
}

/// Capability shared by every command source: parse into a [`Command`].
pub trait CommandFormat {
    /// Native representation this format reads.
    type Input: ?Sized;

    /// Parse one input into a command that has not been validated yet.
    fn parse(&self, input: &Self::Input) -> Result<Command, ParseError>;
}

/// A raw command in one of the supported source representations.
#[derive(Debug, Clone)]
pub enum RawCommand<'a> {
    GuiExport(&'a str),
    DeviceNative(&'a str),
    Simulation(ArrayView2<'a, f64>),
}

/// The set of adapters configured for one mirror.
#[derive(Debug, Clone)]
pub struct Adapters {
    pub gui_export: GuiExportFormat,
    pub device_native: DeviceNativeFormat,
    pub simulation: SimulationArrayFormat,
}

impl Adapters {
    /// Route a raw command to the adapter for its representation.
    pub fn parse(&self, raw: RawCommand<'_>) -> Result<Command, ParseError> {
        match raw {
            RawCommand::GuiExport(text) => self.gui_export.parse(text),
            RawCommand::DeviceNative(text) => self.device_native.parse(text),
            RawCommand::Simulation(view) => self.simulation.parse_view(view),
        }
    }
}

/// Parse a float field, reporting the line on failure.
pub(crate) fn parse_f64(value: &str, line: usize, field: &str) -> Result<f64, ParseError> {
    let value = value.trim();
    value
        .parse::<f64>()
        .map_err(|_| ParseError::malformed(line, format!("invalid {field} value '{value}'")))
}
