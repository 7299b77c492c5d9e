//! Ownership harness around one native module instance.
//!
//! The harness owns:
//!
//! - the module itself, loaded lazily through [`ModuleInit`],
//! - at most one [`StagedInput`] (bytes waiting for a consuming operation),
//! - at most one live [`ResultHandle`] (parsed save or compression context).
//!
//! ```text
//! stage(bytes) ──> [stash] ──take()──> module op ──> set_result(handle)
//!                                                       |
//!                            previous handle freed first
//! ```

pub mod handle;
pub mod init;
pub mod stash;

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::module::{HandleOf, ModuleError, ModuleLoadError, ModuleLoader};

pub use handle::ResultHandle;
pub use init::{ModuleInit, ModuleInitState};
pub use stash::{Provenance, StagedInput};

/// Errors raised by the harness itself or surfaced from its module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),

    #[error("no staged input to take")]
    EmptyStash,

    #[error("no active result handle")]
    NoActiveResult,

    #[error("native module error: {0}")]
    Module(#[from] ModuleError),
}

/// Single-owner container for a module, its staged input and its result.
pub struct OwnershipHarness<L: ModuleLoader> {
    init: ModuleInit<L>,
    stash: Option<StagedInput>,
    result: Option<ResultHandle<HandleOf<L>>>,
}

impl<L: ModuleLoader> OwnershipHarness<L> {
    pub fn new(loader: L) -> Self {
        Self {
            init: ModuleInit::new(loader),
            stash: None,
            result: None,
        }
    }

    /// Load the module if needed. Safe to call any number of times,
    /// concurrently; a failed load can be retried by calling again.
    pub async fn initialize(&self) -> Result<Arc<L::Module>, HarnessError> {
        Ok(self.init.get().await?)
    }

    pub fn init_state(&self) -> ModuleInitState {
        self.init.state()
    }

    pub fn module_name(&self) -> &str {
        self.init.loader().name()
    }

    /// Replace whatever is staged. Never touches the result handle.
    pub fn stage(&mut self, bytes: impl Into<Bytes>, provenance: Provenance) {
        if let Some(old) = &self.stash {
            debug!(
                module = self.module_name(),
                dropped = old.len(),
                "replacing staged input"
            );
        }
        self.stash = Some(StagedInput::new(bytes, provenance));
    }

    /// Move the staged input out. Fails if nothing is staged.
    pub fn take(&mut self) -> Result<StagedInput, HarnessError> {
        self.stash.take().ok_or(HarnessError::EmptyStash)
    }

    /// Peek at the staged input without consuming it.
    pub fn view_staged(&self) -> Result<&StagedInput, HarnessError> {
        self.stash.as_ref().ok_or(HarnessError::EmptyStash)
    }

    pub fn has_staged(&self) -> bool {
        self.stash.is_some()
    }

    /// Install a new result handle, freeing the previous one first.
    pub fn set_result(&mut self, handle: HandleOf<L>) {
        if let Some(previous) = self.result.take() {
            debug!(module = self.module_name(), "releasing previous result handle");
            previous.release();
        }
        self.result = Some(ResultHandle::new(handle));
    }

    pub fn result(&self) -> Result<&ResultHandle<HandleOf<L>>, HarnessError> {
        self.result.as_ref().ok_or(HarnessError::NoActiveResult)
    }

    pub fn result_mut(&mut self) -> Result<&mut ResultHandle<HandleOf<L>>, HarnessError> {
        self.result.as_mut().ok_or(HarnessError::NoActiveResult)
    }

    /// Move the active handle out; the caller becomes responsible for it.
    pub fn take_result(&mut self) -> Result<ResultHandle<HandleOf<L>>, HarnessError> {
        self.result.take().ok_or(HarnessError::NoActiveResult)
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Free the result handle, drop the stash and the module reference.
    /// Idempotent.
    pub fn dispose(&mut self) {
        if let Some(result) = self.result.take() {
            result.release();
        }
        self.stash = None;
        self.init.clear();
        debug!(module = self.module_name(), "harness disposed");
    }
}

impl<L: ModuleLoader> std::fmt::Debug for OwnershipHarness<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipHarness")
            .field("init", &self.init)
            .field("staged", &self.stash.as_ref().map(StagedInput::len))
            .field("has_result", &self.result.is_some())
            .finish()
    }
}
