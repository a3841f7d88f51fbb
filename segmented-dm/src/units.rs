//! Unit conventions for piston and tip/tilt values.
//!
//! The driver electronics take piston in micrometers and tip/tilt in
//! milliradians. Commands built from other sources carry their own
//! [`PttUnits`] tag and are converted with fixed factors only when they are
//! turned into device units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Nanometers per micrometer.
pub const NM_PER_UM: f64 = 1000.0;

/// Microradians per milliradian.
pub const URAD_PER_MRAD: f64 = 1000.0;

/// Unit of a piston value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PistonUnit {
    #[default]
    Micrometers,
    Nanometers,
    /// Optical waves at the given wavelength.
    Waves { wavelength_nm: f64 },
}

impl PistonUnit {
    /// Convert a value in this unit to micrometers.
    pub fn to_micrometers(self, value: f64) -> f64 {
        match self {
            PistonUnit::Micrometers => value,
            PistonUnit::Nanometers => value / NM_PER_UM,
            PistonUnit::Waves { wavelength_nm } => value * wavelength_nm / NM_PER_UM,
        }
    }
}

impl fmt::Display for PistonUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PistonUnit::Micrometers => write!(f, "um"),
            PistonUnit::Nanometers => write!(f, "nm"),
            PistonUnit::Waves { wavelength_nm } => write!(f, "waves@{wavelength_nm}"),
        }
    }
}

impl FromStr for PistonUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "um" | "µm" | "micrometers" => Ok(PistonUnit::Micrometers),
            "nm" | "nanometers" => Ok(PistonUnit::Nanometers),
            _ => {
                let wavelength = s
                    .strip_prefix("waves@")
                    .ok_or_else(|| format!("Invalid piston unit: {s}"))?;
                let wavelength_nm: f64 = wavelength
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid wavelength: {wavelength}"))?;
                if !(wavelength_nm.is_finite() && wavelength_nm > 0.0) {
                    return Err(format!("Wavelength must be positive: {wavelength}"));
                }
                Ok(PistonUnit::Waves { wavelength_nm })
            }
        }
    }
}

/// Unit of a tip or tilt value.
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
pub enum TiltUnit {
    #[default]
    #[strum(to_string = "mrad", serialize = "milliradians")]
    Milliradians,
    #[strum(to_string = "urad", serialize = "µrad", serialize = "microradians")]
    Microradians,
}

impl TiltUnit {
    /// Convert a value in this unit to milliradians.
    pub fn to_milliradians(self, value: f64) -> f64 {
        match self {
            TiltUnit::Milliradians => value,
            TiltUnit::Microradians => value / URAD_PER_MRAD,
        }
    }
}

/// Unit tag carried alongside every command.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PttUnits {
    #[serde(default)]
    pub piston: PistonUnit,
    #[serde(default)]
    pub tilt: TiltUnit,
}

impl PttUnits {
    /// Units the driver electronics consume: µm piston, mrad tip/tilt.
    pub const DEVICE: PttUnits = PttUnits {
        piston: PistonUnit::Micrometers,
        tilt: TiltUnit::Milliradians,
    };

    pub fn is_device(&self) -> bool {
        *self == Self::DEVICE
    }
}

impl fmt::Display for PttUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.piston, self.tilt)
    }
}

impl FromStr for PttUnits {
    type Err = String;

    /// Parse `"<piston>, <tilt>"`, e.g. `"nm, urad"` or `"waves@633, mrad"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (piston, tilt) = s
            .split_once(',')
            .ok_or_else(|| format!("Expected '<piston unit>, <tilt unit>', got: {s}"))?;
        let piston = piston.parse()?;
        let tilt = tilt
            .trim()
            .parse()
            .map_err(|_| format!("Invalid tilt unit: {}", tilt.trim()))?;
        Ok(Self { piston, tilt })
    }
}
