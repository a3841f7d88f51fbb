//! Backends that push a device-native command file to the hardware.
//!
//! The vendor ships a command-line executable that reads one command file and
//! drives the mirror over its private protocol. [`ExecutableDriver`] runs
//! that executable; [`MockDriver`] records invocations for tests and dry
//! runs.

pub mod executable;
pub mod mock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::UnitParams;

pub use executable::ExecutableDriver;
pub use mock::{MockDriver, MockFailure, MockHandle};

/// Errors from a driver backend.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("driver executable is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("failed to launch {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Driver ran and reported failure.
    #[error("driver exited with code {code:?}")]
    Failed { code: Option<i32> },

    /// Driver did not finish in time and was killed.
    #[error("driver did not finish within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Interface to the process that actuates the mirror.
///
/// Calls are serialized by the controller; implementations need no internal
/// locking.
pub trait DriverBackend: Send {
    /// Check that `unit` can be driven. Called once by `open`.
    fn start(&mut self, unit: &UnitParams) -> DriverResult<()>;

    /// Apply the command in `command_file`, blocking until the driver reports
    /// success or failure, or until `timeout` elapses.
    fn apply_file(
        &mut self,
        unit: &UnitParams,
        command_file: &Path,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Release `unit`. Called once by `close`.
    fn stop(&mut self, unit: &UnitParams) -> DriverResult<()>;
}
