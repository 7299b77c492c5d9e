use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use savesync_core::module::{ModuleError, ModuleLoadError, ModuleLoader, NativeHandle, NativeModule, SaveModule};

/// Inputs starting with this prefix are rejected by `parse` with code
/// `unsupported-patch`.
pub const REJECTED_PREFIX: &[u8] = b"BAD";

/// Inputs starting with this prefix make `parse` panic, taking the worker
/// thread down with it.
pub const PANIC_PREFIX: &[u8] = b"CRASH";

/// Shared counters observed by tests.
#[derive(Debug, Default)]
pub struct LoaderProbe {
    loads: AtomicUsize,
    failures_left: AtomicUsize,
    frees: Mutex<Vec<String>>,
    tokens: Mutex<Option<Vec<u8>>>,
}

impl LoaderProbe {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Labels of freed handles, in the order they were freed.
    pub fn frees(&self) -> Vec<String> {
        self.frees.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Option<Vec<u8>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
pub struct CountingSaveLoader {
    probe: Arc<LoaderProbe>,
    delay: Duration,
}

impl CountingSaveLoader {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(LoaderProbe::default()),
            delay: Duration::from_millis(20),
        }
    }

    /// Fail the next `n` loads with a `ModuleLoadError`.
    pub fn failing_first(self, n: usize) -> Self {
        self.probe.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<LoaderProbe> {
        Arc::clone(&self.probe)
    }
}

impl Default for CountingSaveLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleLoader for CountingSaveLoader {
    type Module = FakeSaveModule;

    fn name(&self) -> &str {
        "fake-save"
    }

    async fn load(&self) -> Result<FakeSaveModule, ModuleLoadError> {
        tokio::time::sleep(self.delay).await;
        self.probe.loads.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .probe
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ModuleLoadError::new("fake-save", "token table unavailable"));
        }

        Ok(FakeSaveModule {
            probe: Arc::clone(&self.probe),
        })
    }
}

#[derive(Debug)]
pub struct FakeSaveModule {
    probe: Arc<LoaderProbe>,
}

impl NativeModule for FakeSaveModule {
    type Handle = FakeSaveHandle;
}

impl SaveModule for FakeSaveModule {
    fn set_tokens(&self, tokens: &[u8]) -> Result<(), ModuleError> {
        *self.probe.tokens.lock().unwrap() = Some(tokens.to_vec());
        Ok(())
    }

    fn melt(&self, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let mut out = b"melted:".to_vec();
        out.extend_from_slice(data);
        Ok(out)
    }

    fn parse(&self, data: &[u8]) -> Result<FakeSaveHandle, ModuleError> {
        if data.starts_with(PANIC_PREFIX) {
            panic!("fake-save parser crashed");
        }
        if data.starts_with(REJECTED_PREFIX) {
            return Err(ModuleError::with_code("unsupported-patch", "unsupported version 1.20"));
        }
        Ok(FakeSaveHandle {
            label: String::from_utf8_lossy(data).into_owned(),
            len: data.len(),
            probe: Arc::clone(&self.probe),
        })
    }
}

/// Parsed save; freeing appends its label to the probe's free log.
#[derive(Debug)]
pub struct FakeSaveHandle {
    label: String,
    len: usize,
    probe: Arc<LoaderProbe>,
}

impl FakeSaveHandle {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl NativeHandle for FakeSaveHandle {
    fn free(&mut self) {
        self.probe.frees.lock().unwrap().push(self.label.clone());
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({ "label": self.label, "len": self.len })
    }
}
