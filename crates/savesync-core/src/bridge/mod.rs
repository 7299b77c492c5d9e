//! Message-passing façade that runs a harness on its own worker thread.
//!
//! The worker thread owns a current-thread tokio runtime, the
//! [`OwnershipHarness`] and therefore the native module. Callers never touch
//! either directly; they send closures ("jobs") that the worker runs one at a
//! time against the harness, and await the reply.
//!
//! ```text
//! caller task                          worker thread
//! -----------                          -------------
//! call(op) ──job──> mpsc ────────────> job(&mut harness)
//!     ^                                    |   |
//!     |<──────── progress (mpsc) ──────────+   |
//!     |<──────── reply (oneshot) ──────────────+
//! ```
//!
//! State machine: `Uncreated -> Connecting -> Ready -> Released`. A worker
//! thread that exits on its own (a panicking module call) also ends in
//! `Released`. A released bridge rejects every call with
//! [`BridgeError::Released`] and is never revived; [`BridgeClient`] creates a
//! fresh one instead.

pub mod client;
pub mod save;
pub mod tracker;
pub mod transfer;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::LocalBoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::harness::{HarnessError, OwnershipHarness};
use crate::module::ModuleLoader;

pub use client::BridgeClient;
pub use tracker::ContextTracker;
pub use transfer::TransferBuffer;

use tracker::ContextGuard;

type Job<L> = Box<dyn for<'h> FnOnce(&'h mut OwnershipHarness<L>) -> LocalBoxFuture<'h, ()> + Send>;

fn job<L, F>(f: F) -> Job<L>
where
    L: ModuleLoader,
    F: for<'h> FnOnce(&'h mut OwnershipHarness<L>) -> LocalBoxFuture<'h, ()> + Send + 'static,
{
    Box::new(f)
}

/// Lifecycle of a bridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Uncreated = 0,
    Connecting = 1,
    Ready = 2,
    Released = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgeState::Connecting,
            2 => BridgeState::Ready,
            3 => BridgeState::Released,
            _ => BridgeState::Uncreated,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("worker bridge {0} has been released")]
    Released(String),

    #[error("worker bridge {0} stopped unexpectedly")]
    WorkerGone(String),

    #[error("failed to spawn worker thread for {name}: {message}")]
    Spawn { name: String, message: String },

    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// Configuration for a spawned bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Used for the thread name and in logs.
    pub name: String,
    /// Counts this bridge's worker context while it is alive.
    pub tracker: ContextTracker,
}

impl BridgeOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tracker: ContextTracker::global(),
        }
    }

    pub fn with_tracker(mut self, tracker: ContextTracker) -> Self {
        self.tracker = tracker;
        self
    }
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::named("worker")
    }
}

/// Side channel the worker uses to report progress while a call runs.
#[derive(Debug, Clone)]
pub struct ProgressSender(mpsc::UnboundedSender<u8>);

impl ProgressSender {
    pub fn report(&self, percent: u8) {
        // The caller may have stopped listening; progress is advisory.
        let _ = self.0.send(percent.min(100));
    }
}

struct Inner<L: ModuleLoader> {
    jobs: Option<mpsc::UnboundedSender<Job<L>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Handle to a harness running on a dedicated worker thread.
pub struct WorkerBridge<L: ModuleLoader> {
    name: String,
    state: Arc<AtomicU8>,
    inner: Mutex<Inner<L>>,
}

impl<L: ModuleLoader> WorkerBridge<L> {
    /// Start the worker thread. The module itself is loaded lazily by the
    /// first call that needs it.
    pub fn spawn(loader: L, options: BridgeOptions) -> Result<Self, BridgeError> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(BridgeState::Connecting as u8));
        let guard = options.tracker.enter();

        let worker_state = Arc::clone(&state);
        let worker_name = options.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("savesync-{}", options.name))
            .spawn(move || run_worker(worker_name, loader, jobs_rx, worker_state, guard))
            .map_err(|e| BridgeError::Spawn {
                name: options.name.clone(),
                message: e.to_string(),
            })?;

        info!(bridge = %options.name, "worker bridge spawned");

        Ok(Self {
            name: options.name,
            state,
            inner: Mutex::new(Inner {
                jobs: Some(jobs_tx),
                thread: Some(thread),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Run `op` against the harness on the worker and await its result.
    pub async fn call<R, F>(&self, op: F) -> Result<R, BridgeError>
    where
        R: Send + 'static,
        F: for<'h> FnOnce(&'h mut OwnershipHarness<L>) -> LocalBoxFuture<'h, Result<R, HarnessError>>
            + Send
            + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = job(move |harness| {
            Box::pin(async move {
                let outcome = op(harness).await;
                // The caller may have given up waiting.
                let _ = reply_tx.send(outcome);
            })
        });

        self.sender()?
            .send(job)
            .map_err(|_| BridgeError::WorkerGone(self.name.clone()))?;

        match reply_rx.await {
            Ok(outcome) => outcome.map_err(BridgeError::from),
            Err(_) => Err(BridgeError::WorkerGone(self.name.clone())),
        }
    }

    /// Like [`WorkerBridge::call`], but `op` gets a [`ProgressSender`] and
    /// every report is delivered to `on_progress` on the caller's side, in
    /// order, before the call resolves.
    pub async fn call_with_progress<R, F, C>(&self, op: F, mut on_progress: C) -> Result<R, BridgeError>
    where
        R: Send + 'static,
        F: for<'h> FnOnce(&'h mut OwnershipHarness<L>, ProgressSender) -> LocalBoxFuture<'h, Result<R, HarnessError>>
            + Send
            + 'static,
        C: FnMut(u8),
    {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let progress = ProgressSender(progress_tx);
        let reply = self.call(move |harness| op(harness, progress));
        tokio::pin!(reply);

        loop {
            tokio::select! {
                biased;
                Some(percent) = progress_rx.recv() => on_progress(percent),
                outcome = &mut reply => {
                    while let Ok(percent) = progress_rx.try_recv() {
                        on_progress(percent);
                    }
                    return outcome;
                }
            }
        }
    }

    /// Tear down the worker: stop accepting calls, let queued calls finish,
    /// dispose the harness and join the thread. Idempotent, and also reaps a
    /// worker that already died on its own.
    pub async fn release(&self) {
        let (jobs, thread) = {
            let mut inner = self.lock();
            self.state.store(BridgeState::Released as u8, Ordering::SeqCst);
            (inner.jobs.take(), inner.thread.take())
        };
        if jobs.is_none() && thread.is_none() {
            return;
        }
        drop(jobs);

        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(bridge = %self.name, "worker thread panicked"),
                Err(e) => warn!(bridge = %self.name, error = %e, "failed to join worker thread"),
            }
        }
        info!(bridge = %self.name, "worker bridge released");
    }

    /// Whether calls can still reach a running worker. False once the
    /// bridge is released or its worker thread has exited.
    pub fn is_alive(&self) -> bool {
        let inner = self.lock();
        self.state() != BridgeState::Released && inner.jobs.as_ref().is_some_and(|jobs| !jobs.is_closed())
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Job<L>>, BridgeError> {
        let inner = self.lock();
        match (&inner.jobs, self.state()) {
            (Some(jobs), state) if state != BridgeState::Released => Ok(jobs.clone()),
            _ => Err(BridgeError::Released(self.name.clone())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: ModuleLoader> Drop for WorkerBridge<L> {
    fn drop(&mut self) {
        if self.state() != BridgeState::Released {
            warn!(
                bridge = %self.name,
                "worker bridge dropped without release; worker exits once its queue drains"
            );
        }
    }
}

impl<L: ModuleLoader> std::fmt::Debug for WorkerBridge<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the bridge released when the worker thread exits, including by
/// unwinding out of a panicking module call.
struct ReleaseOnExit {
    name: String,
    state: Arc<AtomicU8>,
}

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        let previous = self.state.swap(BridgeState::Released as u8, Ordering::SeqCst);
        if std::thread::panicking() {
            error!(bridge = %self.name, "worker thread panicked; bridge released");
        } else if previous != BridgeState::Released as u8 {
            debug!(bridge = %self.name, "worker exited before release");
        }
    }
}

/// Body of the worker thread.
fn run_worker<L: ModuleLoader>(
    name: String,
    loader: L,
    mut jobs: mpsc::UnboundedReceiver<Job<L>>,
    state: Arc<AtomicU8>,
    _guard: ContextGuard,
) {
    let _released = ReleaseOnExit {
        name: name.clone(),
        state: Arc::clone(&state),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(bridge = %name, error = %e, "failed to build worker runtime");
            return;
        }
    };

    // A release that raced ahead of startup wins.
    let _ = state.compare_exchange(
        BridgeState::Connecting as u8,
        BridgeState::Ready as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    debug!(bridge = %name, "worker context ready");

    runtime.block_on(async move {
        let mut harness = OwnershipHarness::new(loader);
        while let Some(job) = jobs.recv().await {
            job(&mut harness).await;
        }
        harness.dispose();
    });

    debug!(bridge = %name, "worker context exited");
}
