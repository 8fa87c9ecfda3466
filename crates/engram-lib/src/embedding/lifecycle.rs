//! Background model loading, the ready-gate, and the idle-unload timer.
//!
//! The embedder can take seconds to initialise, so loading runs on a worker
//! thread while callers wait on a gate with a timeout. A positive idle
//! timeout starts a watchdog that releases the model after a quiet period;
//! the next `embed` reloads transparently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MODEL_WAIT_SECS;
use crate::embedding::{Embedder, EmbedderLoader};
use crate::error::{EngramError, Result};

/// Estimated resident size of a loaded MiniLM-class ONNX model.
const ESTIMATED_MODEL_MB: u64 = 85;

/// Watchdog poll interval upper bound.
const WATCHDOG_MAX_SLEEP: Duration = Duration::from_secs(10);

enum LoadState {
    /// No model resident and no load in flight.
    Unloaded,
    Loading,
    Ready(Arc<dyn Embedder>),
    /// A load failed; the error is latched until a forced unload resets it.
    Failed(String),
}

/// Introspection snapshot of the model's resource state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelMemoryReport {
    pub model_loaded: bool,
    pub embedder: Option<String>,
    pub estimated_mb: u64,
    pub idle_timeout_min: Option<f64>,
    pub seconds_idle: Option<f64>,
}

/// Manages one embedder behind a load-on-first-use gate.
pub struct ModelLifecycle {
    loader: EmbedderLoader,
    expected_dimension: usize,
    state: Mutex<LoadState>,
    gate: Condvar,
    last_used: Mutex<Option<Instant>>,
    idle_timeout: Mutex<Option<Duration>>,
    /// Bumped on every unload or timer change; stale loads and watchdogs
    /// check it before acting.
    epoch: AtomicU64,
}

impl ModelLifecycle {
    pub fn new(loader: EmbedderLoader, expected_dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            loader,
            expected_dimension,
            state: Mutex::new(LoadState::Unloaded),
            gate: Condvar::new(),
            last_used: Mutex::new(None),
            idle_timeout: Mutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    /// Whether the ready-gate is currently signalled with a usable model.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), LoadState::Ready(_))
    }

    /// Whether a model is resident in memory.
    pub fn is_loaded(&self) -> bool {
        self.is_ready()
    }

    /// Embed a single text, loading the model on first use.
    pub fn embed(self: &Arc<Self>, text: &str) -> Result<Vec<f32>> {
        let embedder = self.acquire(Duration::from_secs(MODEL_WAIT_SECS))?;
        let result = embedder.embed(text);
        self.touch();
        result
    }

    /// Embed a batch in one model call.
    pub fn embed_batch(self: &Arc<Self>, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.acquire(Duration::from_secs(MODEL_WAIT_SECS))?;
        let result = embedder.embed_batch(texts);
        self.touch();
        result
    }

    /// Block until the model is ready. Returns the embedder identity.
    pub fn warmup(self: &Arc<Self>) -> Result<String> {
        let embedder = self.acquire(Duration::from_secs(MODEL_WAIT_SECS))?;
        Ok(embedder.name().to_string())
    }

    /// Embedder identity when loaded.
    pub fn embedder_name(&self) -> Option<String> {
        match &*self.state.lock() {
            LoadState::Ready(embedder) => Some(embedder.name().to_string()),
            _ => None,
        }
    }

    /// Wait on the ready-gate, starting the background load if nobody has.
    ///
    /// The load routine runs at most once concurrently: the first caller
    /// flips the state to `Loading` and spawns the worker; everyone else
    /// waits on the gate.
    fn acquire(self: &Arc<Self>, wait: Duration) -> Result<Arc<dyn Embedder>> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            match &*state {
                LoadState::Ready(embedder) => return Ok(Arc::clone(embedder)),
                LoadState::Failed(message) => {
                    return Err(EngramError::Embedding(message.clone()));
                }
                LoadState::Unloaded => {
                    *state = LoadState::Loading;
                    self.spawn_load();
                }
                LoadState::Loading => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || self.gate.wait_for(&mut state, remaining).timed_out()
                    {
                        if matches!(&*state, LoadState::Loading) {
                            return Err(EngramError::Embedding(format!(
                                "model load timed out after {}s",
                                wait.as_secs()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn spawn_load(self: &Arc<Self>) {
        let lifecycle = Arc::clone(self);
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!("Starting background model load");
        std::thread::Builder::new()
            .name("engram-model-load".to_string())
            .spawn(move || {
                let outcome = (lifecycle.loader)().and_then(|embedder| {
                    if embedder.dimension() == lifecycle.expected_dimension {
                        Ok(embedder)
                    } else {
                        Err(EngramError::Embedding(format!(
                            "embedder dimension {} does not match database dimension {}",
                            embedder.dimension(),
                            lifecycle.expected_dimension
                        )))
                    }
                });

                let mut state = lifecycle.state.lock();
                if lifecycle.epoch.load(Ordering::SeqCst) != epoch {
                    // Unloaded while we were loading; discard the result.
                    *state = LoadState::Unloaded;
                    lifecycle.gate.notify_all();
                    return;
                }
                match outcome {
                    Ok(embedder) => {
                        info!(embedder = embedder.name(), "Embedding model ready");
                        *state = LoadState::Ready(embedder);
                    }
                    Err(err) => {
                        warn!(error = %err, "Embedding model load failed");
                        *state = LoadState::Failed(err.to_string());
                    }
                }
                lifecycle.gate.notify_all();
            })
            .expect("spawning the model loader thread cannot fail");
    }

    fn touch(self: &Arc<Self>) {
        *self.last_used.lock() = Some(Instant::now());
    }

    /// Configure the idle-unload timer. `None` or a non-positive value
    /// disables it.
    pub fn set_idle_timeout(self: &Arc<Self>, minutes: Option<f64>) {
        let timeout = minutes
            .filter(|m| *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0));
        *self.idle_timeout.lock() = timeout;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(timeout) = timeout {
            self.touch();
            self.spawn_watchdog(epoch, timeout);
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, epoch: u64, timeout: Duration) {
        let lifecycle = Arc::clone(self);
        std::thread::Builder::new()
            .name("engram-idle-unload".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(timeout.min(WATCHDOG_MAX_SLEEP));
                    if lifecycle.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    let idle_for = lifecycle
                        .last_used
                        .lock()
                        .map_or(Duration::ZERO, |t| t.elapsed());
                    if idle_for >= timeout && lifecycle.is_loaded() {
                        info!(idle_secs = idle_for.as_secs(), "Idle timeout: unloading model");
                        lifecycle.unload();
                        return;
                    }
                }
            })
            .expect("spawning the idle watchdog thread cannot fail");
    }

    /// Release the model immediately. Returns `true` if a model (or latched
    /// failure) was cleared.
    pub fn force_unload(self: &Arc<Self>) -> bool {
        self.unload()
    }

    fn unload(self: &Arc<Self>) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let had_model = match &*state {
            LoadState::Ready(_) | LoadState::Failed(_) => true,
            LoadState::Loading => {
                // The in-flight load observes the epoch bump and discards
                // its result; leave the state transition to it.
                return false;
            }
            LoadState::Unloaded => false,
        };
        *state = LoadState::Unloaded;
        self.gate.notify_all();
        had_model
    }

    /// Snapshot of resident memory and idle-timer state.
    pub fn memory_report(&self) -> ModelMemoryReport {
        let (model_loaded, embedder) = match &*self.state.lock() {
            LoadState::Ready(e) => (true, Some(e.name().to_string())),
            _ => (false, None),
        };
        let idle_timeout_min = self
            .idle_timeout
            .lock()
            .map(|d| d.as_secs_f64() / 60.0);
        let seconds_idle = self.last_used.lock().map(|t| t.elapsed().as_secs_f64());
        ModelMemoryReport {
            model_loaded,
            embedder,
            estimated_mb: if model_loaded { ESTIMATED_MODEL_MB } else { 0 },
            idle_timeout_min,
            seconds_idle,
        }
    }
}
