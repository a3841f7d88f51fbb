//! Mirror configuration loaded from JSON.
//!
//! One [`DmConfig`] describes one hardware unit: its serial numbers, the pupil
//! layout, the driver executable and the files it exchanges, and the travel
//! limits. The file is parsed and validated once; everything downstream
//! reads typed fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::Command;
use crate::formats::device_native::{DeviceNativeFormat, NativeHeader, NativeRecordSet};
use crate::formats::gui_export::GuiExportFormat;
use crate::formats::simulation::{SimulationArrayFormat, SimulationOptions, TiltConvention};
use crate::formats::{Adapters, ParseError};
use crate::segment_map::{DriverChannel, MapError, SegmentId, SegmentMap};
use crate::units::PttUnits;
use crate::validator::{validate, TravelLimits, TravelRange, ValidationError};

fn default_driver_timeout_secs() -> f64 {
    30.0
}

/// Errors from loading or checking a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid segment layout: {0}")]
    Map(#[from] MapError),

    #[error("Failed to load flat file {}: {source}", path.display())]
    Flat {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    /// Flat would drive a segment past its travel limits.
    #[error("Flat command is outside the travel limits: {0}")]
    FlatOutOfRange(#[source] ValidationError),
}

/// What `close()` does to the mirror before releasing it.
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
pub enum CloseAction {
    /// Apply the flat before releasing the unit.
    #[default]
    Flatten,
    /// Release the unit, leaving the last shape in place.
    Park,
}

/// Identity of one hardware unit and the executable that drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitParams {
    pub mirror_serial: String,
    pub driver_serial: String,
    pub executable: PathBuf,
}

impl UnitParams {
    /// Key that identifies the physical unit within this process.
    pub fn unit_key(&self) -> &str {
        &self.mirror_serial
    }

    pub fn header(&self) -> NativeHeader {
        NativeHeader {
            mirror_serial: self.mirror_serial.clone(),
            driver_serial: self.driver_serial.clone(),
        }
    }
}

/// Configuration of one segmented mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmConfig {
    pub mirror_serial: String,
    pub driver_serial: String,
    /// Segments physically present on the mirror
    pub total_segments: u32,
    /// Must equal `segments_used.len()`
    pub pupil_segment_count: usize,
    /// Populated segments, center first, center-out
    pub segments_used: Vec<SegmentId>,
    /// Driver channel per entry of `segments_used`; defaults to the segment number
    #[serde(default)]
    pub driver_channels: Option<Vec<DriverChannel>>,
    #[serde(default)]
    pub disabled_segments: Vec<SegmentId>,
    /// Device-native file holding the custom flat
    #[serde(default)]
    pub flat_file: Option<PathBuf>,
    /// Device-native file written before every driver invocation
    pub command_file: PathBuf,
    pub driver_executable: PathBuf,
    #[serde(default = "default_driver_timeout_secs")]
    pub driver_timeout_secs: f64,
    #[serde(default)]
    pub close_action: CloseAction,
    #[serde(default)]
    pub limits: TravelLimits,
    /// Units assumed for GUI exports without a `units` header
    #[serde(default)]
    pub gui_units: PttUnits,
    #[serde(default)]
    pub simulation: SimulationOptions,
}

impl DmConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: DmConfig = serde_json::from_str(&json)?;
        config.validate()?;
        debug!(
            "Loaded configuration for mirror {} from {}",
            config.mirror_serial,
            path.display()
        );
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check field combinations that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.mirror_serial.trim().is_empty() || self.driver_serial.trim().is_empty() {
            return invalid("mirror_serial and driver_serial must not be empty".to_string());
        }
        if self.pupil_segment_count != self.segments_used.len() {
            return invalid(format!(
                "pupil_segment_count is {} but segments_used lists {} segments",
                self.pupil_segment_count,
                self.segments_used.len()
            ));
        }
        if self.pupil_segment_count > self.total_segments as usize {
            return invalid(format!(
                "pupil_segment_count {} exceeds total_segments {}",
                self.pupil_segment_count, self.total_segments
            ));
        }
        if let Some(channels) = &self.driver_channels {
            if channels.len() != self.segments_used.len() {
                return invalid(format!(
                    "driver_channels lists {} channels for {} segments",
                    channels.len(),
                    self.segments_used.len()
                ));
            }
        }
        self.driver_timeout()?;

        for (name, range) in [
            ("piston_um", &self.limits.piston_um),
            ("tip_mrad", &self.limits.tip_mrad),
            ("tilt_mrad", &self.limits.tilt_mrad),
        ] {
            check_range(name, range)?;
        }

        if let Some(geometry) = &self.simulation.geometry {
            let width = geometry.flat_to_flat_m;
            let gap = geometry.gap_m;
            if !width.is_finite() || width <= 0.0 || !gap.is_finite() || gap < 0.0 {
                return invalid(format!(
                    "segment geometry must have positive flat_to_flat_m and non-negative gap_m, got {geometry:?}"
                ));
            }
        } else if self.simulation.tilt_convention == TiltConvention::EdgeDisplacement {
            return invalid("edge_displacement tilt convention requires simulation.geometry".to_string());
        }

        self.segment_map()?;
        Ok(())
    }

    /// Segment map for this unit, including disabled segments.
    pub fn segment_map(&self) -> Result<SegmentMap, ConfigError> {
        let map = SegmentMap::new(
            self.total_segments,
            self.segments_used.clone(),
            self.driver_channels.clone(),
        )?
        .with_disabled(self.disabled_segments.iter().copied())?;
        Ok(map)
    }

    /// Input adapters configured for this unit.
    pub fn adapters(&self) -> Result<Adapters, ConfigError> {
        let map = self.segment_map()?;
        Ok(Adapters {
            gui_export: GuiExportFormat::new(map.clone(), self.gui_units),
            device_native: DeviceNativeFormat::new(map.clone()),
            simulation: SimulationArrayFormat::new(map, self.simulation),
        })
    }

    pub fn unit_params(&self) -> UnitParams {
        UnitParams {
            mirror_serial: self.mirror_serial.clone(),
            driver_serial: self.driver_serial.clone(),
            executable: self.driver_executable.clone(),
        }
    }

    /// Driver timeout as a `Duration`; must be positive and representable.
    pub fn driver_timeout(&self) -> Result<Duration, ConfigError> {
        let secs = self.driver_timeout_secs;
        match Duration::try_from_secs_f64(secs) {
            Ok(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => Err(ConfigError::Invalid(format!(
                "driver_timeout_secs must be a positive number of seconds, got {secs}"
            ))),
        }
    }

    /// The flat command: the custom flat file if configured, else all zeros.
    ///
    /// The result covers every enabled pupil segment and lies within `limits`.
    pub fn load_flat(&self, map: &SegmentMap) -> Result<Command, ConfigError> {
        let zeros = Command::zeros(map);
        let flat = match &self.flat_file {
            Some(path) => self.read_flat(path, map)?.resolved(map, &zeros),
            None => zeros,
        };
        validate(flat, map, &self.limits).map_err(ConfigError::FlatOutOfRange)
    }

    fn read_flat(&self, path: &Path, map: &SegmentMap) -> Result<Command, ConfigError> {
        let flat_error = |source: ParseError| ConfigError::Flat {
            path: path.to_path_buf(),
            source,
        };
        let records = NativeRecordSet::read_from(path).map_err(flat_error)?;
        if records.header.mirror_serial != self.mirror_serial {
            warn!(
                "Flat file {} was written for mirror {}, not {}",
                path.display(),
                records.header.mirror_serial,
                self.mirror_serial
            );
        }
        let flat = DeviceNativeFormat::new(map.clone())
            .parse_records(&records)
            .map_err(flat_error)?;
        debug!("Loaded custom flat from {}", path.display());
        Ok(flat)
    }
}

fn check_range(name: &str, range: &TravelRange) -> Result<(), ConfigError> {
    if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
        return Err(ConfigError::Invalid(format!(
            "limits.{name} must be a finite range with min <= max, got [{}, {}]",
            range.min, range.max
        )));
    }
    Ok(())
}
