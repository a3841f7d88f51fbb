//! Piston-tip-tilt command pipeline for segmented deformable mirrors.
//!
//! Commands arrive in three shapes (vendor GUI exports, the driver's own
//! INI-style command files, and simulation arrays) and all funnel into one
//! canonical [`Command`]:
//!
//! ```text
//! raw input -> formats::* -> Command -> validator::validate -> DmController::apply
//!                                                                 |
//!                                      device-native file <- serialize
//!                                                                 |
//!                                                        driver executable
//! ```
//!
//! - [`segment_map`] - pupil layout and segment-to-channel mapping
//! - [`units`] - piston and tilt unit conventions
//! - [`command`] - the canonical command
//! - [`validator`] - travel-limit checks
//! - [`formats`] - input adapters and the device-native serializer
//! - [`config`] - JSON configuration of one mirror
//! - [`driver`] - backends that run the vendor executable
//! - [`controller`] - open/apply/flatten/close lifecycle
//! - [`state`] - controller state and the published testbed command

pub mod command;
pub mod config;
pub mod controller;
pub mod driver;
pub mod formats;
pub mod segment_map;
pub mod state;
pub mod units;
pub mod validator;

pub use command::{Command, Ptt};
pub use config::{CloseAction, ConfigError, DmConfig, UnitParams};
pub use controller::{ApplyError, ConnectionError, DmController, DmSession};
pub use driver::{DriverBackend, DriverError, ExecutableDriver, MockDriver};
pub use formats::{CommandFormat, ParseError, RawCommand};
pub use segment_map::{DriverChannel, MapError, SegmentId, SegmentMap};
pub use state::{ControllerState, TestbedState};
pub use units::{PistonUnit, PttUnits, TiltUnit};
pub use validator::{validate, TravelLimits, ValidationError};
