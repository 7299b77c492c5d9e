//! Memoized, shared module initialization.
//!
//! Concurrent callers converge on a single in-flight load. A successful load
//! is kept for the lifetime of the cell; a failed one is forgotten so the
//! next caller starts a fresh attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::module::{ModuleLoadError, ModuleLoader};

type LoadFuture<M> = Shared<BoxFuture<'static, Result<Arc<M>, ModuleLoadError>>>;

/// Observable initialization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleInitState {
    NotStarted,
    InFlight,
    Ready,
}

enum Slot<M> {
    NotStarted,
    InFlight { attempt: u64, load: LoadFuture<M> },
    Ready(Arc<M>),
}

/// Lazily loads a module exactly once per successful attempt.
pub struct ModuleInit<L: ModuleLoader> {
    loader: Arc<L>,
    slot: Mutex<Slot<L::Module>>,
    attempts: AtomicU64,
}

impl<L: ModuleLoader> ModuleInit<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            slot: Mutex::new(Slot::NotStarted),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self) -> ModuleInitState {
        match &*self.lock() {
            Slot::NotStarted => ModuleInitState::NotStarted,
            Slot::InFlight { .. } => ModuleInitState::InFlight,
            Slot::Ready(_) => ModuleInitState::Ready,
        }
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Return the loaded module, starting or joining a load if needed.
    pub async fn get(&self) -> Result<Arc<L::Module>, ModuleLoadError> {
        let (attempt, load) = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Ready(module) => return Ok(Arc::clone(module)),
                Slot::InFlight { attempt, load } => (*attempt, load.clone()),
                Slot::NotStarted => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let loader = Arc::clone(&self.loader);
                    debug!(module = loader.name(), attempt, "loading native module");
                    let load = async move { loader.load().await.map(Arc::new) }
                        .boxed()
                        .shared();
                    *slot = Slot::InFlight {
                        attempt,
                        load: load.clone(),
                    };
                    (attempt, load)
                }
            }
        };

        let outcome = load.await;

        let mut slot = self.lock();
        // Only the attempt that is still current may settle the slot.
        if matches!(&*slot, Slot::InFlight { attempt: current, .. } if *current == attempt) {
            *slot = match &outcome {
                Ok(module) => Slot::Ready(Arc::clone(module)),
                Err(e) => {
                    warn!(module = self.loader.name(), attempt, error = %e, "native module load failed");
                    Slot::NotStarted
                }
            };
        }
        outcome
    }

    /// Drop the module reference. A later [`ModuleInit::get`] loads again.
    pub fn clear(&self) {
        *self.lock() = Slot::NotStarted;
    }

    fn lock(&self) -> MutexGuard<'_, Slot<L::Module>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: ModuleLoader> std::fmt::Debug for ModuleInit<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInit")
            .field("module", &self.loader.name())
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::module::{NativeHandle, NativeModule};

    struct Dummy;

    struct DummyHandle;

    impl NativeHandle for DummyHandle {
        fn free(&mut self) {}

        fn metadata(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    impl NativeModule for Dummy {
        type Handle = DummyHandle;
    }

    /// Fails the first `fail_first` loads, then succeeds.
    struct FlakyLoader {
        loads: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl ModuleLoader for FlakyLoader {
        type Module = Dummy;

        fn name(&self) -> &str {
            "flaky"
        }

        async fn load(&self) -> Result<Dummy, ModuleLoadError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if n < self.fail_first {
                Err(ModuleLoadError::new("flaky", "lookup table unavailable"))
            } else {
                Ok(Dummy)
            }
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let init = ModuleInit::new(FlakyLoader {
            loads: Arc::clone(&loads),
            fail_first: 0,
        });

        let results = futures::future::join_all((0..8).map(|_| init.get())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(init.state(), ModuleInitState::Ready);
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(first, r.as_ref().unwrap())));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure_then_retry_succeeds() {
        let loads = Arc::new(AtomicUsize::new(0));
        let init = ModuleInit::new(FlakyLoader {
            loads: Arc::clone(&loads),
            fail_first: 1,
        });

        let results = futures::future::join_all((0..5).map(|_| init.get())).await;
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(init.state(), ModuleInitState::NotStarted);

        init.get().await.expect("second attempt should succeed");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(init.attempts(), 2);
        assert_eq!(init.state(), ModuleInitState::Ready);
    }

    #[tokio::test]
    async fn clear_forces_reload() {
        let loads = Arc::new(AtomicUsize::new(0));
        let init = ModuleInit::new(FlakyLoader {
            loads: Arc::clone(&loads),
            fail_first: 0,
        });

        init.get().await.unwrap();
        init.get().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        init.clear();
        assert_eq!(init.state(), ModuleInitState::NotStarted);
        init.get().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
