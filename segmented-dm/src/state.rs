//! Controller bookkeeping and the process-wide published command.
//!
//! [`TestbedState`] is the slot other subsystems read to learn which shape is
//! currently commanded. Only the controller holding the open connection
//! writes it, and it does so while holding its own state lock so the two
//! never disagree. Readers get an `Arc` snapshot and never block a writer for
//! longer than a pointer copy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use once_cell::sync::Lazy;
use tracing::trace;

use crate::command::Command;

/// Lifecycle state of one controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub is_open: bool,
    /// Last command the driver acknowledged, `None` when closed or not yet applied
    pub current_command: Option<Arc<Command>>,
}

impl ControllerState {
    pub(crate) fn opened() -> Self {
        Self {
            is_open: true,
            current_command: None,
        }
    }
}

/// Shared slot holding the currently commanded shape.
#[derive(Debug, Clone, Default)]
pub struct TestbedState {
    current: Arc<RwLock<Option<Arc<Command>>>>,
}

static GLOBAL_TESTBED: Lazy<TestbedState> = Lazy::new(TestbedState::new);

impl TestbedState {
    /// A private slot, not visible through [`TestbedState::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot.
    pub fn global() -> Self {
        GLOBAL_TESTBED.clone()
    }

    /// Snapshot of the published command.
    pub fn current_command(&self) -> Option<Arc<Command>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn publish(&self, command: Option<Arc<Command>>) {
        trace!("Publishing testbed command: {}", command.is_some());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = command;
    }

    /// Whether two handles refer to the same slot.
    pub fn same_slot(&self, other: &TestbedState) -> bool {
        Arc::ptr_eq(&self.current, &other.current)
    }
}

/// Units currently open in this process, keyed by mirror serial.
static OPEN_UNITS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on one hardware unit, released on drop.
#[derive(Debug)]
pub(crate) struct UnitLock {
    key: String,
}

impl UnitLock {
    /// Claim `key`, or `None` if another controller already holds it.
    pub(crate) fn acquire(key: &str) -> Option<Self> {
        let mut open = OPEN_UNITS.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for UnitLock {
    fn drop(&mut self) {
        OPEN_UNITS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
