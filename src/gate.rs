//! Single-flight gate around the shared forward-pass engine
//!
//! Every forward pass, decoder load/unload and generation loop runs while
//! holding a [`GateGuard`]. The guard releases the gate when dropped, so every
//! exit path (success, early return, error, panic unwinding, a streaming
//! consumer going away) releases it.
//!
//! Waiters are served in arrival order (the underlying semaphore is fair).

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::error::{SteerError, SteerResult};

/// Binary mutual-exclusion resource with blocking and non-blocking acquisition.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permit: Arc<Semaphore>,
}

/// Scoped ownership of the gate. Dropping it releases the gate.
#[derive(Debug)]
pub struct GateGuard {
    _permit: OwnedSemaphorePermit,
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until the gate is free, then hold it.
    ///
    /// Fails only after [`close`][Self::close].
    pub async fn acquire(&self) -> SteerResult<GateGuard> {
        let permit = Arc::clone(&self.permit)
            .acquire_owned()
            .await
            .map_err(|_| SteerError::ShuttingDown)?;
        debug!("gate acquired");
        Ok(GateGuard { _permit: permit })
    }

    /// Hold the gate if it is free right now.
    pub fn try_acquire(&self) -> Option<GateGuard> {
        match Arc::clone(&self.permit).try_acquire_owned() {
            Ok(permit) => Some(GateGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Peek used by status reports; never holds the gate.
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Stop admitting new holders. Current holder and queued waiters are
    /// unaffected until they try to acquire; pending waiters fail.
    pub fn close(&self) {
        self.permit.close();
    }
}
