//! In-memory driver backend.
//!
//! [`MockDriver`] reads every command file it is asked to apply and records
//! it, so tests can assert exactly what would have reached the mirror. A
//! [`MockHandle`] kept by the test inspects the record and injects failures.

use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{DriverBackend, DriverError, DriverResult};
use crate::config::UnitParams;

/// Failure to inject into the next apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Driver exits with this status code.
    Exit(i32),
    /// Driver exceeds its timeout.
    Timeout,
}

#[derive(Debug, Default)]
struct MockLog {
    starts: usize,
    stops: usize,
    applied: Vec<String>,
    fail_start: bool,
    fail_stop: bool,
    next_failure: Option<MockFailure>,
    gate: Option<(SyncSender<()>, Receiver<()>)>,
}

/// Test-side view of a [`MockDriver`].
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    log: Arc<Mutex<MockLog>>,
}

impl MockHandle {
    fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn starts(&self) -> usize {
        self.log().starts
    }

    pub fn stops(&self) -> usize {
        self.log().stops
    }

    /// Number of successful applies.
    pub fn apply_count(&self) -> usize {
        self.log().applied.len()
    }

    /// Contents of every successfully applied command file, oldest first.
    pub fn applied(&self) -> Vec<String> {
        self.log().applied.clone()
    }

    pub fn last_applied(&self) -> Option<String> {
        self.log().applied.last().cloned()
    }

    pub fn fail_start(&self, fail: bool) {
        self.log().fail_start = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.log().fail_stop = fail;
    }

    /// Make the next apply fail. The command file is still read but not recorded.
    pub fn fail_next_apply(&self, failure: MockFailure) {
        self.log().next_failure = Some(failure);
    }

    /// Hold the next apply until released.
    ///
    /// Returns a receiver that fires once the apply has started and a sender
    /// that lets it finish.
    pub fn gate_next_apply(&self) -> (Receiver<()>, SyncSender<()>) {
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::sync_channel(1);
        self.log().gate = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

/// Driver backend that touches no hardware.
#[derive(Debug, Default)]
pub struct MockDriver {
    handle: MockHandle,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl DriverBackend for MockDriver {
    fn start(&mut self, unit: &UnitParams) -> DriverResult<()> {
        let mut log = self.handle.log();
        if log.fail_start {
            return Err(DriverError::Failed { code: Some(1) });
        }
        log.starts += 1;
        debug!("Mock driver started for mirror {}", unit.mirror_serial);
        Ok(())
    }

    fn apply_file(
        &mut self,
        _unit: &UnitParams,
        command_file: &Path,
        timeout: Duration,
    ) -> DriverResult<()> {
        let contents = fs::read_to_string(command_file)?;

        // Wait outside the log lock so the test can keep inspecting the handle
        let gate = self.handle.log().gate.take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }

        let mut log = self.handle.log();
        match log.next_failure.take() {
            Some(MockFailure::Exit(code)) => Err(DriverError::Failed { code: Some(code) }),
            Some(MockFailure::Timeout) => Err(DriverError::Timeout(timeout)),
            None => {
                log.applied.push(contents);
                Ok(())
            }
        }
    }

    fn stop(&mut self, _unit: &UnitParams) -> DriverResult<()> {
        let mut log = self.handle.log();
        log.stops += 1;
        if log.fail_stop {
            return Err(DriverError::Failed { code: Some(1) });
        }
        Ok(())
    }
}
