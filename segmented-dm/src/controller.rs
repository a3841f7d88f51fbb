//! Connection lifecycle of one segmented mirror.
//!
//! ```text
//!   Closed --open()--> Open { current_command: None }
//!   Open   --apply(c) ok--> Open { current_command: Some(c) }
//!   Open   --close()--> Closed   (always, even if flattening fails)
//! ```
//!
//! The controller owns the driver backend behind a mutex. `apply` and
//! `flatten` only *try* to take it, so a second caller gets
//! [`ApplyError::Busy`] instead of interleaving a write with the driver run
//! in flight. `open` and `close` wait for it.
//!
//! The published [`TestbedState`] is updated while the controller's state
//! lock is held, so a reader never sees the two disagree.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{Command, Ptt};
use crate::config::{CloseAction, ConfigError, DmConfig, UnitParams};
use crate::driver::{DriverBackend, DriverError};
use crate::formats::device_native::serialize;
use crate::segment_map::{SegmentId, SegmentMap};
use crate::state::{ControllerState, TestbedState, UnitLock};
use crate::validator::{validate, TravelLimits, ValidationError};

/// Failure to acquire or release the hardware unit.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("driver executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("driver executable is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("mirror {0} is already open in this process")]
    AlreadyOpen(String),

    #[error("failed to start driver: {0}")]
    DriverStart(#[source] DriverError),

    #[error("mirror is not open")]
    NotOpen,

    /// Flattening before release failed; the unit was released anyway.
    #[error("failed to flatten mirror before release: {0}")]
    ParkFailed(#[source] ApplyError),

    /// Driver did not release cleanly; the unit was released anyway.
    #[error("failed to stop driver: {0}")]
    DriverStop(#[source] DriverError),
}

impl ConnectionError {
    fn from_start(error: DriverError) -> Self {
        match error {
            DriverError::ExecutableMissing(path) => ConnectionError::ExecutableMissing(path),
            DriverError::NotExecutable(path) => ConnectionError::NotExecutable(path),
            other => ConnectionError::DriverStart(other),
        }
    }
}

/// Failure to apply a command.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("mirror is not open")]
    NotOpen,

    /// Another apply is in flight on this controller.
    #[error("another command is being applied")]
    Busy,

    /// Command rejected before reaching the device.
    #[error("command rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Command file could not be written; the driver was not run.
    #[error("failed to write command file {}: {source}", path.display())]
    CommandFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Driver reported failure. Mirror shape is unknown.
    #[error("driver failed, mirror state is stale: {0}")]
    Driver(#[source] DriverError),

    /// Driver did not finish in time. Mirror shape is unknown.
    #[error("driver timed out after {0:?}, mirror state is stale")]
    Timeout(Duration),
}

impl ApplyError {
    /// Whether the mirror may hold a shape other than the recorded one.
    ///
    /// `flatten()` is the usual recovery.
    pub fn is_stale(&self) -> bool {
        matches!(self, ApplyError::Driver(_) | ApplyError::Timeout(_))
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ControllerState,
    unit_lock: Option<UnitLock>,
}

/// Controller for one segmented mirror.
pub struct DmController<D: DriverBackend> {
    unit: UnitParams,
    map: SegmentMap,
    limits: TravelLimits,
    flat: Arc<Command>,
    command_file: PathBuf,
    timeout: Duration,
    close_action: CloseAction,
    driver: Mutex<D>,
    inner: Mutex<Inner>,
    testbed: TestbedState,
}

impl<D: DriverBackend> fmt::Debug for DmController<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmController")
            .field("mirror_serial", &self.unit.mirror_serial)
            .field("driver_serial", &self.unit.driver_serial)
            .field("segments", &self.map.len())
            .field("state", &self.state())
            .finish()
    }
}

impl<D: DriverBackend> DmController<D> {
    /// Build a closed controller for the configured unit.
    ///
    /// Validates `config` and loads the custom flat, if one is configured.
    /// Publishes to [`TestbedState::global`].
    pub fn new(config: &DmConfig, driver: D) -> Result<Self, ConfigError> {
        config.validate()?;
        let map = config.segment_map()?;
        let flat = config.load_flat(&map)?;
        Ok(Self {
            unit: config.unit_params(),
            map,
            limits: config.limits,
            flat: Arc::new(flat),
            command_file: config.command_file.clone(),
            timeout: config.driver_timeout()?,
            close_action: config.close_action,
            driver: Mutex::new(driver),
            inner: Mutex::new(Inner::default()),
            testbed: TestbedState::global(),
        })
    }

    /// Publish to `testbed` instead of the global slot.
    pub fn with_testbed(mut self, testbed: TestbedState) -> Self {
        self.testbed = testbed;
        self
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> MutexGuard<'_, D> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_driver(&self) -> Result<MutexGuard<'_, D>, ApplyError> {
        match self.driver.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(ApplyError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Acquire exclusive access to the mirror.
    pub fn open(&self) -> Result<(), ConnectionError> {
        let mut driver = self.lock_driver();
        let key = self.unit.unit_key();
        if self.is_open() {
            return Err(ConnectionError::AlreadyOpen(key.to_string()));
        }

        let unit_lock =
            UnitLock::acquire(key).ok_or_else(|| ConnectionError::AlreadyOpen(key.to_string()))?;
        driver
            .start(&self.unit)
            .map_err(ConnectionError::from_start)?;

        let mut inner = self.lock_inner();
        inner.state = ControllerState::opened();
        inner.unit_lock = Some(unit_lock);
        self.testbed.publish(None);
        info!(
            "Opened mirror {} (driver {}), {} pupil segments",
            self.unit.mirror_serial,
            self.unit.driver_serial,
            self.map.len()
        );
        Ok(())
    }

    /// Validate `command`, write it and run the driver.
    ///
    /// The recorded command changes only when the driver reports success.
    pub fn apply(&self, command: Command) -> Result<(), ApplyError> {
        let mut driver = self.try_lock_driver()?;
        if !self.is_open() {
            return Err(ApplyError::NotOpen);
        }
        self.apply_locked(&mut driver, command)
    }

    /// Apply `command` on top of the custom flat.
    pub fn apply_relative_to_flat(&self, command: Command) -> Result<(), ApplyError> {
        self.apply(command.offset_by(&self.flat))
    }

    /// Return every pupil segment to the flat.
    pub fn flatten(&self) -> Result<(), ApplyError> {
        self.apply(Command::clone(&self.flat))
    }

    /// Move each enabled pupil segment away from the flat in turn.
    ///
    /// Every step applies the flat with one segment offset by `offset`
    /// (device units), then calls `after_each` with that segment. Stops at the
    /// first error. Returns the number of segments poked.
    pub fn poke_each_segment<E, F>(&self, offset: Ptt, mut after_each: F) -> Result<usize, E>
    where
        F: FnMut(SegmentId) -> Result<(), E>,
        E: From<ApplyError>,
    {
        let mut poked = 0;
        for segment in self.map.enabled_segments() {
            let base = self.flat.get(segment).unwrap_or(Ptt::ZERO);
            self.apply(self.flat.with_segment(segment, base + offset))?;
            debug!("Poked segment {segment} of mirror {}", self.unit.mirror_serial);
            after_each(segment)?;
            poked += 1;
        }
        Ok(poked)
    }

    fn apply_locked(&self, driver: &mut D, command: Command) -> Result<(), ApplyError> {
        let command = validate(command, &self.map, &self.limits)?;

        serialize(&command, &self.map, &self.flat, self.unit.header())
            .write_to(&self.command_file)
            .map_err(|source| ApplyError::CommandFile {
                path: self.command_file.clone(),
                source,
            })?;
        debug!("Command file written to {}", self.command_file.display());

        if let Err(error) = driver.apply_file(&self.unit, &self.command_file, self.timeout) {
            warn!(
                "Mirror {} state is stale after driver failure: {error}",
                self.unit.mirror_serial
            );
            return Err(match error {
                DriverError::Timeout(timeout) => ApplyError::Timeout(timeout),
                other => ApplyError::Driver(other),
            });
        }

        let command = Arc::new(command);
        let mut inner = self.lock_inner();
        inner.state.current_command = Some(Arc::clone(&command));
        self.testbed.publish(Some(command));
        info!(
            "Applied command to {} segments of mirror {}",
            self.map.len(),
            self.unit.mirror_serial
        );
        Ok(())
    }

    /// Flatten or park per configuration, then release the mirror.
    ///
    /// The controller is closed afterwards even when this returns an error.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let mut driver = self.lock_driver();
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }
        let _reset = ResetOnExit { controller: self };

        let mut result = Ok(());
        if self.close_action == CloseAction::Flatten {
            if let Err(error) = self.apply_locked(&mut driver, Command::clone(&self.flat)) {
                warn!(
                    "Failed to flatten mirror {} before release: {error}",
                    self.unit.mirror_serial
                );
                result = Err(ConnectionError::ParkFailed(error));
            }
        }

        if let Err(error) = driver.stop(&self.unit) {
            warn!("Failed to stop driver for {}: {error}", self.unit.mirror_serial);
            if result.is_ok() {
                result = Err(ConnectionError::DriverStop(error));
            }
        }

        info!("Closed mirror {}", self.unit.mirror_serial);
        result
    }

    /// Open the mirror and return a guard that closes it when dropped.
    pub fn session(&self) -> Result<DmSession<'_, D>, ConnectionError> {
        self.open()?;
        Ok(DmSession {
            controller: self,
            closed: false,
        })
    }

    /// Run `work` with the mirror open, closing it on every exit path.
    ///
    /// An error from `work` takes precedence over an error from closing.
    pub fn with_session<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&DmController<D>) -> Result<T, E>,
        E: From<ConnectionError>,
    {
        let session = self.session()?;
        match work(session.controller) {
            Ok(value) => {
                session.close()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(close_error) = session.close() {
                    warn!("Error closing mirror after failure: {close_error}");
                }
                Err(error)
            }
        }
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.lock_inner().state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock_inner().state.is_open
    }

    pub fn current_command(&self) -> Option<Arc<Command>> {
        self.lock_inner().state.current_command.clone()
    }

    pub fn segment_map(&self) -> &SegmentMap {
        &self.map
    }

    pub fn limits(&self) -> &TravelLimits {
        &self.limits
    }

    /// The command `flatten()` applies.
    pub fn flat_command(&self) -> &Command {
        &self.flat
    }

    pub fn unit(&self) -> &UnitParams {
        &self.unit
    }

    pub fn testbed(&self) -> &TestbedState {
        &self.testbed
    }
}

impl<D: DriverBackend> Drop for DmController<D> {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                "Mirror {} dropped while open, closing",
                self.unit.mirror_serial
            );
            if let Err(error) = self.close() {
                warn!("Implicit close failed: {error}");
            }
        }
    }
}

/// Resets the controller to `Closed` when dropped.
struct ResetOnExit<'a, D: DriverBackend> {
    controller: &'a DmController<D>,
}

impl<D: DriverBackend> Drop for ResetOnExit<'_, D> {
    fn drop(&mut self) {
        let mut inner = self.controller.lock_inner();
        inner.state = ControllerState::default();
        inner.unit_lock = None;
        self.controller.testbed.publish(None);
    }
}

/// Open mirror that closes itself when dropped.
pub struct DmSession<'a, D: DriverBackend> {
    controller: &'a DmController<D>,
    closed: bool,
}

impl<D: DriverBackend> DmSession<'_, D> {
    /// Close now and report the outcome.
    pub fn close(mut self) -> Result<(), ConnectionError> {
        self.closed = true;
        self.controller.close()
    }
}

impl<D: DriverBackend> Deref for DmSession<'_, D> {
    type Target = DmController<D>;

    fn deref(&self) -> &DmController<D> {
        self.controller
    }
}

impl<D: DriverBackend> Drop for DmSession<'_, D> {
    fn drop(&mut self) {
        if self.closed || !self.controller.is_open() {
            return;
        }
        if let Err(error) = self.controller.close() {
            warn!("Error closing mirror session: {error}");
        }
    }
}
