//! Shared fakes for savesync integration tests.
//!
//! - [`CountingSaveLoader`]: a save module that counts loads, can fail its
//!   first N loads, logs every handle it frees, in order, and can be made
//!   to panic mid-parse.
//! - [`GatedValidator`], [`StaticValidator`], [`UnreachableValidator`]:
//!   validators with controllable timing and outcomes.
//! - [`RecordingStore`]: an in-memory store that records the order of puts
//!   and deletes and can be made slow or faulty.
//! - [`spawn_server`]: serve an axum router on an ephemeral local port.

mod save_module;
mod server;
mod stores;
mod validators;

pub use save_module::{CountingSaveLoader, FakeSaveHandle, FakeSaveModule, LoaderProbe, PANIC_PREFIX, REJECTED_PREFIX};
pub use server::{TestServer, spawn_server};
pub use stores::{RecordingStore, StoreEvent};
pub use validators::{GatedValidator, StaticValidator, UnreachableValidator};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test tracing subscriber once per test binary. Honours
/// `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic, poorly compressible bytes.
pub fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
