use crate::{
    backend::{Interrogation, Interrogator},
    config::{SerializationMode, TaggerConfig},
    error::TaggerError,
    filter::{Caption, FilterPolicy, FilterRecord, FilterState, ThresholdPolicy},
    registry::{ModelHandle, ModelRegistry, lock_handle},
};
use image::DynamicImage;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// A single-image call finalizes a batch of one.
const SINGLE_IMAGE_BATCH: usize = 1;

/// Steps of one interrogation, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    GateAcquired,
    StateReset,
    Inferring,
    Aggregating,
    Responding,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::GateAcquired => "gate_acquired",
            Phase::StateReset => "state_reset",
            Phase::Inferring => "inferring",
            Phase::Aggregating => "aggregating",
            Phase::Responding => "responding",
        }
    }
}

fn enter(phase: Phase) {
    tracing::debug!(phase = phase.as_str(), "Interrogation phase");
}

struct Metrics {
    duration: Histogram<f64>,
    interrogations: Counter<u64>,
    failures: Counter<u64>,
    unloaded: Counter<u64>,
}

fn init_metrics(meter_name: &'static str) -> Metrics {
    let meter = global::meter(meter_name);
    let latency_buckets = [
        0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0,
    ];

    Metrics {
        duration: meter
            .f64_histogram("tagger_interrogation_duration_seconds")
            .with_description("Time from request admission to finalized caption, gate wait included")
            .with_unit("s")
            .with_boundaries(latency_buckets.to_vec())
            .build(),
        interrogations: meter
            .u64_counter("tagger_interrogations_total")
            .with_description("Interrogations that produced a caption")
            .build(),
        failures: meter
            .u64_counter("tagger_interrogation_failures_total")
            .with_description("Interrogations that failed after passing validation")
            .build(),
        unloaded: meter
            .u64_counter("tagger_models_unloaded_total")
            .with_description("Models that released their resources on unload")
            .build(),
    }
}

/// Runs interrogations against registered models and aggregates their output.
///
/// The service owns the one [`FilterState`] of the process, behind a mutex
/// that doubles as the serialization gate: whoever holds the lock is the only
/// code reading or writing the state. In [`SerializationMode::Global`] the
/// engine call happens under the gate as well, so at most one interrogation
/// runs at a time across all models.
pub struct InterrogationService {
    registry: Arc<ModelRegistry>,
    gate: Mutex<FilterState>,
    policy: Arc<dyn FilterPolicy>,
    mode: SerializationMode,
    metrics: Metrics,
}

impl InterrogationService {
    pub fn new(registry: Arc<ModelRegistry>, config: &TaggerConfig) -> Self {
        Self::with_policy(
            registry,
            Arc::new(ThresholdPolicy::new(&config.filter)),
            config.serialization,
        )
    }

    pub fn with_policy(
        registry: Arc<ModelRegistry>,
        policy: Arc<dyn FilterPolicy>,
        mode: SerializationMode,
    ) -> Self {
        Self {
            registry,
            gate: Mutex::new(FilterState::new()),
            policy,
            mode,
            metrics: init_metrics("tagger"),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn mode(&self) -> SerializationMode {
        self.mode
    }

    /// Registered model names. Never waits on the gate.
    pub fn interrogators(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Tag `image` with `model_name` and return the merged caption.
    ///
    /// Input is validated before the gate is touched: a missing image or an
    /// unknown model fails without waiting and without mutating the filter
    /// state. Blocks while another interrogation holds the gate.
    pub fn interrogate(
        &self,
        image: Option<&DynamicImage>,
        model_name: &str,
    ) -> Result<Caption, TaggerError> {
        let image = image.ok_or(TaggerError::ImageNotFound)?;
        let handle = self.registry.get(model_name).inspect_err(|_| {
            tracing::debug!(model = %model_name, "Interrogation requested for unknown model");
        })?;

        let _span = common::span!("interrogate", model = %model_name);
        let start = Instant::now();

        let result = match self.mode {
            SerializationMode::Global => self.interrogate_serialized(&handle, image),
            SerializationMode::PerModel => self.interrogate_per_model(&handle, image),
        };

        let attributes = [KeyValue::new("model", model_name.to_string())];
        self.metrics
            .duration
            .record(start.elapsed().as_secs_f64(), &attributes);

        match &result {
            Ok(caption) => {
                self.metrics.interrogations.add(1, &attributes);
                tracing::debug!(labels = caption.len(), "Interrogation complete");
            }
            Err(e) => {
                self.metrics.failures.add(1, &attributes);
                tracing::error!(error = %e, "Interrogation failed");
            }
        }

        result
    }

    fn interrogate_serialized(
        &self,
        handle: &ModelHandle,
        image: &DynamicImage,
    ) -> Result<Caption, TaggerError> {
        let mut state = self.acquire_gate();
        enter(Phase::GateAcquired);

        state.reset();
        enter(Phase::StateReset);

        let output = {
            let mut engine = lock_handle(handle);
            run_engine(&mut **engine, image)?
        };

        Ok(self.aggregate(&mut state, output))
    }

    fn interrogate_per_model(
        &self,
        handle: &ModelHandle,
        image: &DynamicImage,
    ) -> Result<Caption, TaggerError> {
        let output = {
            let mut engine = lock_handle(handle);
            run_engine(&mut **engine, image)?
        };

        let mut state = self.acquire_gate();
        enter(Phase::GateAcquired);

        state.reset();
        enter(Phase::StateReset);

        Ok(self.aggregate(&mut state, output))
    }

    fn aggregate(&self, state: &mut FilterState, output: Interrogation) -> Caption {
        enter(Phase::Aggregating);
        let _span = common::span_debug!("aggregate");

        let Interrogation { ratings, tags } = output;
        state.apply_filters(
            FilterRecord::anonymous(ratings, tags),
            self.policy.as_ref(),
        );
        let caption = state
            .finalize(SINGLE_IMAGE_BATCH, self.policy.as_ref())
            .merge();

        // Still under the gate: the caller holds the guard until this returns.
        enter(Phase::Responding);
        caption
    }

    /// Lock the gate. A previous holder that panicked leaves the lock
    /// poisoned; the state is reset before every use, so it is safe to take
    /// it back.
    fn acquire_gate(&self) -> MutexGuard<'_, FilterState> {
        self.gate.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovering interrogation gate after a panicked holder");
            poisoned.into_inner()
        })
    }

    /// Inspect the filter state under the gate.
    ///
    /// The state holds the last interrogation's results until the next one
    /// resets it.
    pub fn with_state<R>(&self, f: impl FnOnce(&FilterState) -> R) -> R {
        let state = self.acquire_gate();
        f(&state)
    }

    /// Unload every model and return how many actually freed resources.
    ///
    /// Takes the gate first, so this waits for an in-flight interrogation
    /// instead of tearing its engine down underneath it.
    pub fn unload_all(&self) -> usize {
        let _gate = self.acquire_gate();
        let unloaded = self.registry.unload_all();

        self.metrics.unloaded.add(unloaded as u64, &[]);
        tracing::info!(
            unloaded,
            registered = self.registry.len(),
            "Unloaded interrogators"
        );

        unloaded
    }
}

fn run_engine(
    engine: &mut dyn Interrogator,
    image: &DynamicImage,
) -> Result<Interrogation, TaggerError> {
    enter(Phase::Inferring);
    let _span = common::span!("model_inference");
    engine.interrogate(image).map_err(TaggerError::Engine)
}
