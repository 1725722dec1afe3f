//! Worker states and the registration that holds them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::{Result, ServiceWorkerError};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// One deployed version of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Store identifier this worker owns.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Set by skip-waiting; lets `Installed → Activating` bypass the gate.
    pub skip_waiting: bool,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// The installing / waiting / active slots for one scope.
///
/// At most one worker occupies each slot. A new version moves
/// installing → waiting → active; the worker it displaces becomes redundant.
#[derive(Debug, Default)]
pub struct Registration {
    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Version of the active worker, i.e. the current store.
    pub fn active_version(&self) -> Option<&str> {
        self.active.as_ref().map(|w| w.version.as_str())
    }

    /// Find a worker in any slot.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    fn worker_mut(&mut self, id: ServiceWorkerId) -> Option<&mut ServiceWorker> {
        [&mut self.installing, &mut self.waiting, &mut self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// State of a worker; redundant once it has left every slot.
    pub fn state_of(&self, id: ServiceWorkerId) -> ServiceWorkerState {
        self.worker(id)
            .map_or(ServiceWorkerState::Redundant, |w| w.state)
    }

    /// Put a new worker into the installing slot.
    ///
    /// A worker already installing is displaced and becomes redundant.
    pub fn start_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let displaced = self.installing.replace(worker);
        displaced.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<()> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installed);
                if let Some(mut old) = self.waiting.replace(worker) {
                    old.set_state(ServiceWorkerState::Redundant);
                }
                Ok(())
            }
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(
                    "worker is not installing".to_string(),
                ))
            }
        }
    }

    /// Drop a failed install. The active worker is untouched.
    pub fn install_failed(&mut self, id: ServiceWorkerId, error: &str) -> Option<ServiceWorker> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.error = Some(error.to_string());
                worker.set_state(ServiceWorkerState::Redundant);
                Some(worker)
            }
            other => {
                self.installing = other;
                None
            }
        }
    }

    /// Mark a worker as wanting to skip the waiting gate.
    pub fn set_skip_waiting(&mut self, id: ServiceWorkerId) -> Result<()> {
        let worker = self
            .worker_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound("worker is redundant".to_string()))?;
        worker.skip_waiting = true;
        Ok(())
    }

    /// Whether the waiting worker may start activating.
    ///
    /// Open when the waiting worker asked to skip waiting, when there is no
    /// active worker, or when the active worker controls no clients.
    pub fn can_activate(&self, id: ServiceWorkerId, active_controls_clients: bool) -> bool {
        match &self.waiting {
            Some(worker) if worker.id == id => {
                worker.skip_waiting || self.active.is_none() || !active_controls_clients
            }
            _ => false,
        }
    }

    /// Move the waiting worker into the active slot in `Activating` state.
    ///
    /// Returns the worker it replaced, now redundant.
    pub fn begin_activate(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>> {
        match self.waiting.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activating);
                let replaced = self.active.replace(worker).map(|mut old| {
                    old.set_state(ServiceWorkerState::Redundant);
                    old
                });
                Ok(replaced)
            }
            other => {
                self.waiting = other;
                Err(ServiceWorkerError::StateError(
                    "worker is not waiting".to_string(),
                ))
            }
        }
    }

    pub fn finish_activate(&mut self, id: ServiceWorkerId) -> Result<()> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(
                "worker is not activating".to_string(),
            )),
        }
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}
