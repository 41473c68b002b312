//! Memory admission gate.
//!
//! A weighted semaphore whose permits are megabytes of the process budget.
//! Worker threads reserve their module's declared minimum before the main
//! processing step and give it back when the reservation drops.

use std::sync::Arc;

use sysinfo::{System, SystemExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Shared memory budget for all worker threads of a process.
pub struct MemoryGate {
    semaphore: Arc<Semaphore>,
    budget_mb: u32,
}

impl MemoryGate {
    /// A gate with a fixed budget in megabytes.
    pub fn new(budget_mb: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(budget_mb as usize)),
            budget_mb,
        }
    }

    /// A gate sized to the host's physical memory.
    ///
    /// Returns `None` when memory cannot be measured; the caller then runs
    /// without admission control.
    pub fn from_system() -> Option<Self> {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_mb = sys.total_memory() / BYTES_PER_MB;
        if total_mb == 0 {
            warn!("Could not determine physical memory; admission control disabled");
            return None;
        }
        let budget_mb = u32::try_from(total_mb).unwrap_or(u32::MAX);
        info!(budget_mb, "Memory admission gate enabled");
        Some(Self::new(budget_mb))
    }

    pub fn budget_mb(&self) -> u32 {
        self.budget_mb
    }

    /// Megabytes not currently reserved.
    pub fn available_mb(&self) -> u32 {
        self.semaphore.available_permits() as u32
    }

    /// Wait until `min_mb` can be reserved, then reserve it.
    ///
    /// Requests above the whole budget are clamped to the budget so they can
    /// still run once every other reservation is released.
    pub async fn acquire(&self, min_mb: u64) -> MemoryReservation {
        let requested = if min_mb > u64::from(self.budget_mb) {
            warn!(
                requested_mb = min_mb,
                budget_mb = self.budget_mb,
                "Memory request exceeds budget, clamping"
            );
            self.budget_mb
        } else {
            min_mb as u32
        };

        if requested == 0 {
            return MemoryReservation::empty();
        }

        debug!(
            requested_mb = requested,
            available_mb = self.available_mb(),
            "Waiting for memory reservation"
        );
        match Arc::clone(&self.semaphore)
            .acquire_many_owned(requested)
            .await
        {
            Ok(permit) => MemoryReservation {
                permit: Some(permit),
                megabytes: requested,
            },
            Err(e) => {
                warn!(error = %e, "Memory gate closed; proceeding without reservation");
                MemoryReservation::empty()
            }
        }
    }
}

/// Megabytes held from a [`MemoryGate`]; returned on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    permit: Option<OwnedSemaphorePermit>,
    megabytes: u32,
}

impl MemoryReservation {
    fn empty() -> Self {
        Self {
            permit: None,
            megabytes: 0,
        }
    }

    pub fn megabytes(&self) -> u32 {
        self.megabytes
    }

    /// Return the reservation to the budget now.
    pub fn release(mut self) {
        if self.permit.take().is_some() {
            debug!(released_mb = self.megabytes, "Memory reservation released");
        }
    }
}
