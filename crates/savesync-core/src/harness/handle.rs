//! Single-owner wrapper around a native handle.

use tracing::debug;

use crate::module::NativeHandle;

/// Owns a [`NativeHandle`] and frees it exactly once.
///
/// [`ResultHandle::release`] frees explicitly. Dropping an unreleased
/// handle frees it as well, so a handle can never leak, and a released one
/// is never freed twice.
pub struct ResultHandle<H: NativeHandle> {
    inner: H,
    released: bool,
}

impl<H: NativeHandle> ResultHandle<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    pub fn get(&self) -> &H {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut H {
        &mut self.inner
    }

    pub fn metadata(&self) -> serde_json::Value {
        self.inner.metadata()
    }

    /// Free the native memory now.
    pub fn release(mut self) {
        self.free_once();
    }

    fn free_once(&mut self) {
        if !self.released {
            self.inner.free();
            self.released = true;
        }
    }
}

impl<H: NativeHandle> Drop for ResultHandle<H> {
    fn drop(&mut self) {
        if !self.released {
            debug!("freeing result handle on drop");
            self.free_once();
        }
    }
}

impl<H: NativeHandle> std::fmt::Debug for ResultHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counted(Arc<AtomicUsize>);

    impl NativeHandle for Counted {
        fn free(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn metadata(&self) -> serde_json::Value {
            serde_json::json!({ "kind": "counted" })
        }
    }

    #[test]
    fn release_frees_once() {
        let frees = Arc::new(AtomicUsize::new(0));
        let handle = ResultHandle::new(Counted(Arc::clone(&frees)));
        handle.release();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_frees_unreleased_handle() {
        let frees = Arc::new(AtomicUsize::new(0));
        {
            let handle = ResultHandle::new(Counted(Arc::clone(&frees)));
            assert_eq!(handle.metadata()["kind"], "counted");
        }
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }
}
