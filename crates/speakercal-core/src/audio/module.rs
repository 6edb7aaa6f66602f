//! Handle-based MLS excitation module
//!
//! [`MlsModule`] is loaded once per process and hands out [`MlsHandle`]s.
//! A handle owns the per-session working memory (excitation, averaged
//! recording) and must be released exactly once. Release happens either
//! explicitly through [`MlsHandle::release`] or when the handle is dropped,
//! so every exit path of a session frees it, including errors and task
//! cancellation. Using a released handle fails with
//! [`ExcitationError::UseAfterRelease`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::OnceCell;

use super::hadamard::MlsTables;
use super::recorder::RecordingSet;
use super::signal::{self, ExcitationSignal};
use crate::{MAX_MLS_ORDER, MIN_MLS_ORDER};

/// Errors raised by the excitation module
#[derive(Error, Debug)]
pub enum ExcitationError {
    #[error("Failed to initialise MLS module: {0}")]
    ModuleInit(String),

    #[error("MLS order {order} outside supported range {min}..={max}")]
    InvalidOrder { order: u32, min: u32, max: u32 },

    #[error("No recorded rounds to correlate")]
    EmptyRecording,

    #[error("MLS handle {0} used after release")]
    UseAfterRelease(u64),

    #[error("No excitation generated on this handle")]
    NoExcitation,
}

impl ExcitationError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModuleInit(_) => "ModuleInitError",
            Self::InvalidOrder { .. } => "InvalidOrderError",
            Self::EmptyRecording => "EmptyRecordingError",
            Self::UseAfterRelease(_) => "UseAfterReleaseError",
            Self::NoExcitation => "NoExcitationError",
        }
    }
}

/// Impulse response extracted from one session
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    /// Sample rate of the recordings it was derived from
    pub sample_rate: u32,
    /// P + 1 samples, scaled by 1 / (P + 1)
    pub samples: Vec<f64>,
}

struct ModuleInner {
    tables: Mutex<HashMap<u32, Arc<MlsTables>>>,
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

static SHARED: OnceCell<MlsModule> = OnceCell::const_new();

/// Loaded excitation module
///
/// Cloning is cheap; clones share the table cache and handle counters.
#[derive(Clone)]
pub struct MlsModule {
    inner: Arc<ModuleInner>,
}

impl std::fmt::Debug for MlsModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlsModule")
            .field("acquired", &self.acquired_handles())
            .field("released", &self.released_handles())
            .finish()
    }
}

impl MlsModule {
    /// Load a fresh module instance
    ///
    /// Validates the taps table on the blocking pool. Most callers want
    /// [`MlsModule::shared`] instead.
    pub async fn load() -> Result<Self, ExcitationError> {
        tokio::task::spawn_blocking(|| {
            for order in MIN_MLS_ORDER..=MAX_MLS_ORDER {
                let taps = signal::taps(order)?;
                if taps[order as usize - 1] != 1 {
                    return Err(ExcitationError::ModuleInit(format!(
                        "taps for order {} do not close the delay line",
                        order
                    )));
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| ExcitationError::ModuleInit(e.to_string()))??;

        tracing::info!("MLS module loaded");

        Ok(Self {
            inner: Arc::new(ModuleInner {
                tables: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        })
    }

    /// Process-wide module, loaded on first use
    pub async fn shared() -> Result<Self, ExcitationError> {
        SHARED.get_or_try_init(Self::load).await.cloned()
    }

    /// Acquire a new handle
    pub async fn create(&self) -> Result<MlsHandle, ExcitationError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(handle = id, "MLS handle acquired");

        Ok(MlsHandle {
            module: Arc::clone(&self.inner),
            id,
            state: Some(HandleState::default()),
        })
    }

    /// Handles acquired so far
    pub fn acquired_handles(&self) -> u64 {
        self.inner.acquired.load(Ordering::Acquire)
    }

    /// Handles released so far
    pub fn released_handles(&self) -> u64 {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Handles acquired but not yet released
    pub fn live_handles(&self) -> u64 {
        self.acquired_handles() - self.released_handles()
    }
}

impl ModuleInner {
    fn tables(&self, order: u32) -> Result<Arc<MlsTables>, ExcitationError> {
        signal::check_order(order)?;

        let mut cache = self
            .tables
            .lock()
            .map_err(|_| ExcitationError::ModuleInit("table cache poisoned".into()))?;
        if let Some(tables) = cache.get(&order) {
            return Ok(Arc::clone(tables));
        }

        let tables = Arc::new(MlsTables::build(order)?);
        cache.insert(order, Arc::clone(&tables));
        Ok(tables)
    }
}

#[derive(Default)]
struct HandleState {
    tables: Option<Arc<MlsTables>>,
    recorded: Option<(Vec<f64>, u32)>,
}

/// Exclusive handle to module working memory for one session
pub struct MlsHandle {
    module: Arc<ModuleInner>,
    id: u64,
    state: Option<HandleState>,
}

impl std::fmt::Debug for MlsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlsHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl MlsHandle {
    /// Handle identifier, unique per module
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether [`MlsHandle::release`] already ran
    pub fn is_released(&self) -> bool {
        self.state.is_none()
    }

    fn state_mut(&mut self) -> Result<&mut HandleState, ExcitationError> {
        self.state
            .as_mut()
            .ok_or(ExcitationError::UseAfterRelease(self.id))
    }

    /// Generate the excitation for `order`
    ///
    /// Deterministic: the same order always yields the same 2^order - 1
    /// bipolar samples.
    pub fn generate(&mut self, order: u32) -> Result<ExcitationSignal, ExcitationError> {
        let id = self.id;
        if self.is_released() {
            return Err(ExcitationError::UseAfterRelease(id));
        }
        let tables = self.module.tables(order)?;
        let signal = tables.signal().clone();

        let state = self.state_mut()?;
        state.tables = Some(tables);
        state.recorded = None;

        tracing::debug!(handle = id, order, samples = signal.len(), "Generated MLS");
        Ok(signal)
    }

    /// Ingest the recorded rounds for correlation
    ///
    /// Rounds are averaged element-wise over one period: longer rounds are
    /// truncated to P samples, shorter ones zero-padded.
    pub fn set_recorded_signal(&mut self, recordings: &RecordingSet) -> Result<(), ExcitationError> {
        let id = self.id;
        let state = self.state_mut()?;
        let tables = state.tables.as_ref().ok_or(ExcitationError::NoExcitation)?;
        if recordings.is_empty() {
            return Err(ExcitationError::EmptyRecording);
        }

        let p = tables.period();
        let mut averaged = vec![0.0f64; p];
        for round in recordings.iter() {
            for (acc, &sample) in averaged.iter_mut().zip(round.samples.iter()) {
                *acc += sample as f64;
            }
        }
        let count = recordings.len() as f64;
        for acc in averaged.iter_mut() {
            *acc /= count;
        }

        let sample_rate = recordings.last().map(|r| r.sample_rate).unwrap_or(0);
        state.recorded = Some((averaged, sample_rate));

        tracing::debug!(
            handle = id,
            rounds = recordings.len(),
            period = p,
            "Recorded signal set"
        );
        Ok(())
    }

    /// Correlate the excitation against the ingested recording
    pub fn compute_impulse_response(&mut self) -> Result<ImpulseResponse, ExcitationError> {
        let state = self.state_mut()?;
        let tables = state.tables.as_ref().ok_or(ExcitationError::NoExcitation)?;
        let (recorded, sample_rate) = state
            .recorded
            .as_ref()
            .ok_or(ExcitationError::EmptyRecording)?;

        Ok(ImpulseResponse {
            sample_rate: *sample_rate,
            samples: tables.impulse_response(recorded),
        })
    }

    /// Release the handle's working memory
    ///
    /// Only the first call has an effect.
    pub fn release(&mut self) {
        if self.state.take().is_some() {
            self.module.released.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(handle = self.id, "MLS handle released");
        }
    }
}

impl Drop for MlsHandle {
    fn drop(&mut self) {
        self.release();
    }
}
