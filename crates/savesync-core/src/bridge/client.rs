//! Lazily created, reusable bridge connection.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use super::{BridgeError, BridgeOptions, BridgeState, WorkerBridge};
use crate::module::ModuleLoader;

/// Owns at most one live [`WorkerBridge`] and creates it on first use.
///
/// Keep one `BridgeClient` per process (or per server state) and call
/// [`BridgeClient::release`] from the teardown path; otherwise the worker
/// thread outlives its users.
pub struct BridgeClient<L: ModuleLoader + Clone> {
    loader: L,
    options: BridgeOptions,
    bridge: Mutex<Option<Arc<WorkerBridge<L>>>>,
}

impl<L: ModuleLoader + Clone> BridgeClient<L> {
    pub fn new(loader: L, options: BridgeOptions) -> Self {
        Self {
            loader,
            options,
            bridge: Mutex::new(None),
        }
    }

    /// Return the live bridge, spawning one if none exists yet or the
    /// previous worker has exited.
    pub async fn get(&self) -> Result<Arc<WorkerBridge<L>>, BridgeError> {
        let mut slot = self.bridge.lock().await;
        if let Some(bridge) = slot.take() {
            if bridge.is_alive() {
                *slot = Some(Arc::clone(&bridge));
                return Ok(bridge);
            }
            warn!(bridge = %self.options.name, "previous worker is gone; spawning a new one");
            bridge.release().await;
        }

        let bridge = Arc::new(WorkerBridge::spawn(self.loader.clone(), self.options.clone())?);
        *slot = Some(Arc::clone(&bridge));
        Ok(bridge)
    }

    pub async fn state(&self) -> BridgeState {
        match self.bridge.lock().await.as_ref() {
            Some(bridge) => bridge.state(),
            None => BridgeState::Uncreated,
        }
    }

    /// Release the current bridge, if any. The next [`BridgeClient::get`]
    /// spawns a fresh one.
    pub async fn release(&self) {
        let bridge = self.bridge.lock().await.take();
        if let Some(bridge) = bridge {
            bridge.release().await;
        }
    }
}

impl<L: ModuleLoader + Clone> std::fmt::Debug for BridgeClient<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("name", &self.options.name)
            .finish_non_exhaustive()
    }
}
