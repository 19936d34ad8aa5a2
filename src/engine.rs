//! Color processing engine
//!
//! Wires selector, strategies, perceptual coordinator, merge engine and caches
//! into one single-flight pipeline:
//!
//! ```text
//! submit → cache → dedup → [idle? run : queue] → select → execute (join_all)
//!        → perceptual → merge → cache write → publish → next queued
//! ```
//!
//! Every public entry point resolves to a [`ColorResult`]. Failures inside any
//! stage are logged, counted and replaced by the next best answer, ending at
//! [`ColorResult::fallback`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use soma_chroma::{ColorContext, ColorEngine, MusicData};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ColorEngine::builder().build()?;
//! engine.init()?;
//!
//! let context = ColorContext::new("spotify:track:1", [("VIBRANT", "#ff0000")])
//!     .with_music_data(MusicData::new(0.9, 0.6));
//! let result = engine.process_colors(context).await;
//! println!("accent {}", result.accent_hex);
//!
//! engine.dispose().await;
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, DedupCache, ResultCache};
use crate::capabilities::{CapabilityProbe, StaticProbe};
use crate::config::EngineConfig;
use crate::context::{ColorContext, ColorResult, ColorsExtractedEvent, StrategyOutcome, Submission};
use crate::error::{ChromaError, Result};
use crate::events::{BusEvent, EventBus, MemoryEventBus, Topic};
use crate::merge::MergeEngine;
use crate::metrics::{Metrics, Timer};
use crate::perceptual::{self, OklabCoordinator, PerceptualCoordinator};
use crate::queue::{EngineState, PendingWork, ProcessingState};
use crate::selector::{RegistrySelector, SelectionCriteria, StrategySelector};
use crate::settings::{self, MemorySettings, SettingsStore};
use crate::strategies::{MoodTintStrategy, VibrantAccentStrategy};
use crate::strategy::{ColorStrategy, FallbackStrategy};

struct Caches {
    results: ResultCache,
    dedup: DedupCache,
}

struct EngineInner {
    config: EngineConfig,
    selector: Arc<dyn StrategySelector>,
    coordinator: Arc<dyn PerceptualCoordinator>,
    settings: Arc<dyn SettingsStore>,
    probe: Arc<dyn CapabilityProbe>,
    bus: Arc<dyn EventBus>,
    fallback: Arc<dyn ColorStrategy>,
    merge: MergeEngine,
    state: Mutex<ProcessingState>,
    caches: Mutex<Caches>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

/// Handle to one engine instance. Clones share the same engine.
#[derive(Clone)]
pub struct ColorEngine {
    inner: Arc<EngineInner>,
}

/// Explicit wiring of every collaborator. Anything left unset gets a fresh,
/// instance-owned default.
#[derive(Default)]
pub struct ColorEngineBuilder {
    config: EngineConfig,
    selector: Option<Arc<dyn StrategySelector>>,
    coordinator: Option<Arc<dyn PerceptualCoordinator>>,
    settings: Option<Arc<dyn SettingsStore>>,
    probe: Option<Arc<dyn CapabilityProbe>>,
    bus: Option<Arc<dyn EventBus>>,
    metrics: Option<Arc<Metrics>>,
}

impl ColorEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn selector(mut self, selector: Arc<dyn StrategySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn PerceptualCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ColorEngine> {
        self.config.validate()?;
        let config = self.config;

        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(MemorySettings::new()) as Arc<dyn SettingsStore>);

        let coordinator = self.coordinator.unwrap_or_else(|| {
            let intensity = settings.get_f64(settings::KEY_INTENSITY).unwrap_or(1.0);
            Arc::new(OklabCoordinator::with_intensity(intensity)) as Arc<dyn PerceptualCoordinator>
        });

        let selector = self.selector.unwrap_or_else(|| {
            Arc::new(
                RegistrySelector::new()
                    .with_strategy(Arc::new(VibrantAccentStrategy))
                    .with_strategy(Arc::new(MoodTintStrategy::default())),
            ) as Arc<dyn StrategySelector>
        });

        let inner = EngineInner {
            state: Mutex::new(ProcessingState::new(config.max_queue_size)),
            caches: Mutex::new(Caches {
                results: ResultCache::new(config.cache_ttl(), config.cache_soft_cap, config.cache_sweep_every),
                dedup: DedupCache::new(config.dedup_ttl(), config.dedup_key),
            }),
            merge: MergeEngine::new(config.conflict_policy),
            selector,
            coordinator,
            settings,
            probe: self.probe.unwrap_or_else(|| Arc::new(StaticProbe::default())),
            bus: self.bus.unwrap_or_else(|| Arc::new(MemoryEventBus::new())),
            fallback: Arc::new(FallbackStrategy::new()),
            metrics: self.metrics.unwrap_or_else(Metrics::new),
            shutdown: CancellationToken::new(),
            listeners: std::sync::Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            config,
        };

        Ok(ColorEngine {
            inner: Arc::new(inner),
        })
    }
}

impl ColorEngine {
    pub fn builder() -> ColorEngineBuilder {
        ColorEngineBuilder::default()
    }

    /// Subscribe to inbound extraction events and settings changes.
    /// Must be called from within a tokio runtime. Calling twice is a no-op.
    pub fn init(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ChromaError::Config("engine already disposed".to_string()));
        }
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let events = inner.bus.subscribe(Topic::ColorsExtracted, &inner.config.subscriber_name);
        let extraction_listener = tokio::spawn(listen_for_extractions(
            Arc::downgrade(inner),
            events,
            inner.shutdown.clone(),
        ));

        let changes = inner.settings.subscribe();
        let settings_listener = tokio::spawn(listen_for_settings(
            Arc::downgrade(inner),
            changes,
            inner.shutdown.clone(),
        ));

        let mut listeners = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(extraction_listener);
        listeners.push(settings_listener);

        info!(
            "Color engine initialized (multi_strategy={}, policy={}, queue={})",
            inner.config.multi_strategy,
            inner.merge.policy().as_str(),
            inner.config.max_queue_size
        );
        Ok(())
    }

    /// Stop listening, cancel in-flight work and release queued submitters
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.shutdown.cancel();
        inner.bus.unsubscribe_all(&inner.config.subscriber_name);
        for handle in inner.listeners.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }

        {
            let mut state = inner.state.lock().await;
            for work in state.queue.drain() {
                work.respond(ColorResult::fallback("engine disposed"));
            }
        }
        {
            let mut caches = inner.caches.lock().await;
            caches.results.invalidate_all();
            caches.dedup.clear();
        }

        info!("Color engine disposed");
    }

    /// Total: always resolves to a result, falling back when anything fails
    pub async fn process_colors(&self, context: ColorContext) -> ColorResult {
        self.inner.submit_context(context).await
    }

    pub async fn submit(&self, submission: Submission) -> ColorResult {
        self.inner.submit_context(submission.into_context()).await
    }

    pub async fn submit_context(&self, context: ColorContext) -> ColorResult {
        self.inner.submit_context(context).await
    }

    pub async fn submit_raw_event(&self, event: ColorsExtractedEvent) -> ColorResult {
        self.inner.submit_context(event.into()).await
    }

    pub async fn state(&self) -> EngineState {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return EngineState::Disposed;
        }
        if self.inner.state.lock().await.is_processing {
            EngineState::Processing
        } else {
            EngineState::Idle
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Track ids waiting in the queue, oldest first
    pub async fn pending_track_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.queue.iter().map(|w| w.context.track_id.clone()).collect()
    }

    pub async fn last_result(&self) -> Option<ColorResult> {
        self.inner.state.lock().await.last_result.clone()
    }

    pub async fn invalidate_cache(&self) {
        self.inner.invalidate_cache().await;
    }

    pub async fn cache_len(&self) -> usize {
        self.inner.caches.lock().await.results.len()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl EngineInner {
    async fn submit_context(self: &Arc<Self>, context: ColorContext) -> ColorResult {
        if self.disposed.load(Ordering::SeqCst) {
            return ColorResult::fallback("engine disposed");
        }

        {
            let mut caches = self.caches.lock().await;
            if let Some(hit) = caches.results.get(&fingerprint(&context, self.config.cache_key)) {
                self.metrics.record_cache_hit();
                debug!("Cache hit for track {}", context.track_id);
                return hit;
            }
            if let Some(previous) = caches.dedup.check(&context) {
                self.metrics.record_dedup_hit();
                debug!("Dedup hit for track {}", context.track_id);
                return previous;
            }
        }

        self.metrics.record_extraction();
        let (work, rx) = PendingWork::new(context);
        let start = {
            let mut state = self.state.lock().await;
            if state.is_processing {
                debug!("Engine busy, queueing track {}", work.context.track_id);
                if let Some(dropped) = state.queue.push(work) {
                    self.metrics.record_dropped();
                    warn!(
                        "Queue full ({}), dropping oldest context for track {}",
                        state.queue.capacity(),
                        dropped.context.track_id
                    );
                    let superseded = state
                        .last_result
                        .clone()
                        .unwrap_or_else(|| ColorResult::fallback("superseded by newer context"));
                    dropped.respond(superseded);
                }
                None
            } else {
                state.is_processing = true;
                Some(work)
            }
        };

        if let Some(work) = start {
            tokio::spawn(Arc::clone(self).drive(work));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => ColorResult::fallback("processing abandoned"),
        }
    }

    /// Owns the processing slot until the queue is empty
    async fn drive(self: Arc<Self>, mut work: PendingWork) {
        let mut slot = SlotRelease::new(Arc::clone(&self));
        loop {
            let result = self.run_cycle(&work.context).await;
            work.respond(result);

            let next = {
                let mut state = self.state.lock().await;
                if self.shutdown.is_cancelled() {
                    for pending in state.queue.drain() {
                        pending.respond(ColorResult::fallback("engine disposed"));
                    }
                    state.is_processing = false;
                    slot.disarm();
                    return;
                }
                match state.queue.pop() {
                    Some(next) => next,
                    None => {
                        state.is_processing = false;
                        slot.disarm();
                        return;
                    }
                }
            };

            // Let other tasks run between cycles
            tokio::task::yield_now().await;
            work = next;
        }
    }

    /// One context through the pipeline under the watchdog
    async fn run_cycle(&self, context: &ColorContext) -> ColorResult {
        let cycle = {
            let mut state = self.state.lock().await;
            state.cycle += 1;
            state.cycle
        };
        let cancel = self.shutdown.child_token();
        let timeout = self.config.processing_timeout();
        let timer = Timer::new();

        let pipeline = AssertUnwindSafe(self.pipeline(context, cancel.clone())).catch_unwind();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, pipeline) => outcome,
            _ = cancel.cancelled() => {
                debug!("Cycle {} cancelled by shutdown", cycle);
                return ColorResult::fallback(ChromaError::Cancelled.to_string());
            }
        };

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!("Cycle {} for track {} panicked", cycle, context.track_id);
                ColorResult::fallback("processing panicked")
            }
            Err(_) => {
                // Dropping the pipeline future stops every strategy it was awaiting
                cancel.cancel();
                self.metrics.record_timeout();
                let err = ChromaError::ProcessingTimeout(self.config.processing_timeout_ms);
                error!("Cycle {} for track {}: {}", cycle, context.track_id, err);
                return ColorResult::fallback(err.to_string());
            }
        };

        let elapsed = timer.elapsed_ms();
        result.metadata.processing_time_ms = elapsed;
        if result.source_context.is_none() {
            result.source_context = Some(context.clone());
        }
        self.metrics.record_cycle(elapsed, result.is_fallback());

        if !result.is_fallback() {
            let mut caches = self.caches.lock().await;
            caches.results.insert(fingerprint(context, self.config.cache_key), result.clone());
            caches.dedup.record(context, result.clone());
        }

        self.state.lock().await.last_result = Some(result.clone());

        let delivered = self.bus.publish(BusEvent::ColorsHarmonized((&result).into()));
        debug!(
            "Cycle {} done for track {} in {:.1}ms via {} ({} subscribers)",
            cycle, context.track_id, elapsed, result.metadata.strategy_name, delivered
        );

        result
    }

    async fn pipeline(&self, context: &ColorContext, cancel: CancellationToken) -> ColorResult {
        let criteria = SelectionCriteria::from_environment(&self.probe.capabilities(), self.settings.as_ref());

        let selected = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.selector
                .select_strategies(context, &criteria, self.config.strategy_limit())
        }))
        .unwrap_or_else(|_| Err(ChromaError::StrategySelection("selector panicked".to_string())));

        let strategies = match selected {
            Ok(selected) if !selected.is_empty() => selected,
            Ok(_) => {
                self.metrics.record_selection_failure();
                warn!("Selector returned no strategies, using fallback");
                vec![Arc::clone(&self.fallback)]
            }
            Err(e) => {
                self.metrics.record_selection_failure();
                warn!("{}; using fallback strategy", e);
                vec![Arc::clone(&self.fallback)]
            }
        };

        let outcomes: Vec<StrategyOutcome> = join_all(
            strategies
                .iter()
                .map(|strategy| self.execute(strategy.as_ref(), context, cancel.clone())),
        )
        .await;

        if !self.config.perceptual_enabled {
            return self.merge.merge(outcomes);
        }

        let successes: Vec<StrategyOutcome> = outcomes.iter().filter(|o| o.success).cloned().collect();
        if successes.len() >= 2 {
            return match self.coordinate(context).await {
                Ok(output) => perceptual::blend_outcomes(output, &successes),
                Err(e) => {
                    self.metrics.record_coordination_failure();
                    warn!("{}; merging without perceptual stage", e);
                    self.merge.merge(outcomes)
                }
            };
        }

        let merged = self.merge.merge(outcomes);
        if merged.is_fallback() {
            return merged;
        }
        match self.coordinate(context).await {
            Ok(output) => perceptual::apply_to_result(merged, output),
            Err(e) => {
                self.metrics.record_coordination_failure();
                warn!("{}; keeping unenhanced result", e);
                merged
            }
        }
    }

    async fn execute(
        &self,
        strategy: &dyn ColorStrategy,
        context: &ColorContext,
        cancel: CancellationToken,
    ) -> StrategyOutcome {
        let name = strategy.name().to_string();
        let timer = Timer::new();

        let can_process =
            std::panic::catch_unwind(AssertUnwindSafe(|| strategy.can_process(context))).unwrap_or(false);
        if !can_process {
            self.metrics.record_strategy(false);
            return StrategyOutcome::failed(name, "strategy cannot process context", 0.0);
        }

        let result = guarded(strategy.process(context, cancel)).await;
        let elapsed = timer.elapsed_ms();
        self.metrics.record_strategy(result.is_ok());

        match result {
            Ok(mut result) => {
                if result.source_context.is_none() {
                    result.source_context = Some(context.clone());
                }
                StrategyOutcome::succeeded(name, result, elapsed)
            }
            Err(e) => {
                warn!("Strategy {} failed: {}", name, e);
                StrategyOutcome::failed(name, e.to_string(), elapsed)
            }
        }
    }

    async fn coordinate(&self, context: &ColorContext) -> Result<perceptual::CoordinationOutput> {
        guarded(self.coordinator.coordinate(context))
            .await
            .map_err(|e| match e {
                ChromaError::PerceptualCoordination(_) => e,
                other => ChromaError::PerceptualCoordination(other.to_string()),
            })
    }

    async fn invalidate_cache(&self) {
        let mut caches = self.caches.lock().await;
        let dropped = caches.results.len();
        caches.results.invalidate_all();
        debug!("Result cache invalidated ({} entries)", dropped);
    }
}

/// Frees the processing slot if the driver exits without doing so itself
struct SlotRelease {
    engine: Option<Arc<EngineInner>>,
}

impl SlotRelease {
    fn new(engine: Arc<EngineInner>) -> Self {
        Self { engine: Some(engine) }
    }

    fn disarm(&mut self) {
        self.engine = None;
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        error!("Processing driver exited abnormally, releasing the slot");

        if let Ok(mut state) = engine.state.try_lock() {
            release_slot(&mut state);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_slot(&mut *engine.state.lock().await);
            });
        }
    }
}

fn release_slot(state: &mut ProcessingState) {
    state.is_processing = false;
    for pending in state.queue.drain() {
        pending.respond(ColorResult::fallback("processing aborted"));
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Turn a panic inside a collaborator future into an error
async fn guarded<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(ChromaError::StrategyExecution {
            strategy: "unknown".to_string(),
            message: "panicked".to_string(),
        }),
    }
}

async fn listen_for_extractions(
    engine: Weak<EngineInner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<BusEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let BusEvent::ColorsExtracted(extracted) = event else {
            continue;
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };

        debug!("Colors extracted for track {}", extracted.track_id);
        tokio::spawn(async move {
            engine.submit_context(extracted.into()).await;
        });
    }
    debug!("Extraction listener stopped");
}

async fn listen_for_settings(
    engine: Weak<EngineInner>,
    mut changes: broadcast::Receiver<settings::SettingChange>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };
        let invalidate = match change {
            Ok(change) => settings::invalidates_cache(&change.key),
            // Missed changes may have touched the relevant keys
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !invalidate {
            continue;
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.invalidate_cache().await;
    }
    debug!("Settings listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MusicData, DEFAULT_ACCENT_HEX};
    use crate::perceptual::EmotionalState;
    use crate::strategy::QualityTier;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Clone, Copy)]
    enum Behavior {
        Passthrough,
        Fail,
        Panic,
        Hang,
        Gated,
    }

    struct Probe {
        name: &'static str,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    }

    impl Probe {
        fn new(name: &'static str, behavior: Behavior) -> Self {
            Self {
                name,
                behavior,
                calls: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(Semaphore::new(0)),
            }
        }
    }

    #[async_trait]
    impl ColorStrategy for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn can_process(&self, _context: &ColorContext) -> bool {
            true
        }
        fn estimated_cost(&self, _context: &ColorContext) -> f64 {
            1.0
        }
        fn quality_tier(&self) -> QualityTier {
            QualityTier::Balanced
        }
        async fn process(&self, context: &ColorContext, _cancel: CancellationToken) -> Result<ColorResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Passthrough => {}
                Behavior::Fail => return Err(ChromaError::strategy(self.name, "boom")),
                Behavior::Panic => panic!("strategy blew up"),
                Behavior::Hang => std::future::pending::<()>().await,
                Behavior::Gated => {
                    let permit = self.gate.acquire().await;
                    drop(permit);
                }
            }
            Ok(ColorResult::from_colors(self.name, context.valid_colors(), context))
        }
    }

    /// Panics while the selector ranks it
    struct UnpricedStrategy;

    #[async_trait]
    impl ColorStrategy for UnpricedStrategy {
        fn name(&self) -> &str {
            "unpriced"
        }
        fn can_process(&self, _context: &ColorContext) -> bool {
            true
        }
        fn estimated_cost(&self, _context: &ColorContext) -> f64 {
            panic!("no cost model")
        }
        async fn process(&self, context: &ColorContext, _cancel: CancellationToken) -> Result<ColorResult> {
            Ok(ColorResult::from_colors("unpriced", context.valid_colors(), context))
        }
    }

    struct BrokenProbe;

    impl CapabilityProbe for BrokenProbe {
        fn capabilities(&self) -> crate::capabilities::DeviceCapabilities {
            panic!("device query failed")
        }
    }

    /// Counts calls; fails instead of coordinating when `fail` is set
    struct CountingCoordinator {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CountingCoordinator {
        fn new(fail: bool) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail,
            }
        }
    }

    #[async_trait]
    impl PerceptualCoordinator for CountingCoordinator {
        async fn coordinate(&self, context: &ColorContext) -> Result<perceptual::CoordinationOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChromaError::PerceptualCoordination("gamut solver diverged".to_string()));
            }
            OklabCoordinator::new().coordinate(context).await
        }
    }

    fn engine_with(strategies: Vec<Arc<dyn ColorStrategy>>, config: EngineConfig) -> ColorEngine {
        let mut selector = RegistrySelector::new();
        for strategy in strategies {
            selector.register(strategy);
        }
        ColorEngine::builder()
            .config(config)
            .selector(Arc::new(selector))
            .build()
            .unwrap()
    }

    fn red(track: &str) -> ColorContext {
        ColorContext::new(track, [("VIBRANT", "#ff0000")])
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..1000 {
            if condition().await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_default_engine_processes() {
        let engine = ColorEngine::builder().build().unwrap();
        let context = ColorContext::new("t1", [("VIBRANT", "#ff0000"), ("MUTED", "#556677")])
            .with_music_data(MusicData::new(0.5, 0.5));

        let result = engine.process_colors(context).await;
        assert!(!result.is_fallback());
        assert!(result.processed_colors.contains_key("oklab-VIBRANT"));
        assert_eq!(engine.state().await, EngineState::Idle);
        assert_eq!(engine.metrics().snapshot().processed_count, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_energetic_red() {
        let probe = Arc::new(Probe::new("passthrough", Behavior::Passthrough));
        let engine = engine_with(vec![probe as Arc<dyn ColorStrategy>], EngineConfig::default());

        let result = engine
            .process_colors(red("t1").with_music_data(MusicData::new(0.9, 0.5)))
            .await;

        assert_eq!(result.accent_hex, "#ff0000");
        assert_eq!(result.accent_rgb, "255,0,0");
        let metrics = result.metadata.coordination_metrics.expect("coordination metrics");
        assert_eq!(metrics.emotional_state, EmotionalState::Energetic);
    }

    #[tokio::test]
    async fn test_totality_on_degenerate_input() {
        let engine = ColorEngine::builder().build().unwrap();

        let empty = engine
            .process_colors(ColorContext::new("t1", Vec::<(String, String)>::new()))
            .await;
        assert_eq!(empty.metadata.strategy_name, FallbackStrategy::NAME);
        assert_eq!(empty.accent_hex, DEFAULT_ACCENT_HEX);
        assert_eq!(engine.metrics().snapshot().stages.selection_failures, 1);

        let invalid = engine
            .process_colors(ColorContext::new("t2", [("VIBRANT", "not-a-color")]))
            .await;
        assert!(invalid.is_fallback());
        assert!(invalid.metadata.error.is_some());

        let no_music = engine.process_colors(red("t3")).await;
        assert!(!no_music.is_fallback());
        assert_eq!(
            no_music.metadata.coordination_metrics.map(|m| m.emotional_state),
            Some(EmotionalState::Balanced)
        );
    }

    #[tokio::test]
    async fn test_failing_and_panicking_strategies_fall_back() {
        let config = EngineConfig {
            multi_strategy: true,
            ..Default::default()
        };
        let engine = engine_with(
            vec![
                Arc::new(Probe::new("fails", Behavior::Fail)),
                Arc::new(Probe::new("panics", Behavior::Panic)),
            ],
            config,
        );

        let result = engine.process_colors(red("t1")).await;
        assert!(result.is_fallback());
        assert_eq!(result.accent_hex, DEFAULT_ACCENT_HEX);
        assert_eq!(engine.state().await, EngineState::Idle);

        let stages = engine.metrics().snapshot().stages;
        assert_eq!(stages.strategy_runs, 2);
        assert_eq!(stages.strategy_failures, 2);
    }

    #[tokio::test]
    async fn test_multi_strategy_blends_successes() {
        let config = EngineConfig {
            multi_strategy: true,
            ..Default::default()
        };
        let engine = engine_with(
            vec![
                Arc::new(Probe::new("a", Behavior::Passthrough)),
                Arc::new(Probe::new("b", Behavior::Passthrough)),
                Arc::new(Probe::new("broken", Behavior::Fail)),
            ],
            config,
        );

        let result = engine.process_colors(red("t1")).await;
        assert_eq!(result.metadata.strategy_name, "oklab-coordinated");
        assert!(result.metadata.strategies_used.contains(&"a".to_string()));
        assert!(result.metadata.strategies_used.contains(&"b".to_string()));
        assert!(!result.metadata.strategies_used.contains(&"broken".to_string()));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_strategies() {
        let probe = Arc::new(Probe::new("spy", Behavior::Passthrough));
        let calls = Arc::clone(&probe.calls);
        let coordinator = Arc::new(CountingCoordinator::new(false));
        let coordinations = Arc::clone(&coordinator.calls);
        let engine = ColorEngine::builder()
            .selector(Arc::new(RegistrySelector::new().with_strategy(probe)))
            .coordinator(coordinator)
            .build()
            .unwrap();

        let context = red("t1");
        let first = engine.process_colors(context.clone()).await;
        let second = engine.process_colors(context).await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinations.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics().snapshot().cache_hit_count, 1);
    }

    #[tokio::test]
    async fn test_roles_cache_key_shares_entries_across_palettes() {
        let probe = Arc::new(Probe::new("spy", Behavior::Passthrough));
        let calls = Arc::clone(&probe.calls);
        let config = EngineConfig {
            cache_key: crate::cache::CacheKeyMode::Roles,
            ..Default::default()
        };
        let engine = engine_with(vec![probe as Arc<dyn ColorStrategy>], config);

        let first = engine.process_colors(red("t1")).await;
        let second = engine
            .process_colors(ColorContext::new("t2", [("VIBRANT", "#0000ff")]))
            .await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coordination_failure_keeps_unenhanced_result() {
        let coordinator = Arc::new(CountingCoordinator::new(true));
        let engine = ColorEngine::builder()
            .selector(Arc::new(
                RegistrySelector::new().with_strategy(Arc::new(Probe::new("plain", Behavior::Passthrough))),
            ))
            .coordinator(coordinator.clone())
            .build()
            .unwrap();

        let result = engine
            .process_colors(red("t1").with_music_data(MusicData::new(0.9, 0.5)))
            .await;

        assert!(!result.is_fallback());
        assert_eq!(result.metadata.strategy_name, "plain");
        assert_eq!(result.accent_hex, "#ff0000");
        assert!(result.metadata.coordination_metrics.is_none());
        assert!(!result.processed_colors.keys().any(|k| k.starts_with("oklab-")));
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics().snapshot().stages.coordination_failures, 1);
    }

    #[tokio::test]
    async fn test_coordination_failure_in_multi_mode_merges() {
        let config = EngineConfig {
            multi_strategy: true,
            ..Default::default()
        };
        let engine = ColorEngine::builder()
            .config(config)
            .selector(Arc::new(
                RegistrySelector::new()
                    .with_strategy(Arc::new(Probe::new("a", Behavior::Passthrough)))
                    .with_strategy(Arc::new(Probe::new("b", Behavior::Passthrough))),
            ))
            .coordinator(Arc::new(CountingCoordinator::new(true)))
            .build()
            .unwrap();

        let result = engine.process_colors(red("t1")).await;

        assert!(!result.is_fallback());
        assert_eq!(result.metadata.strategy_name, "merged");
        assert!(!result.processed_colors.keys().any(|k| k.starts_with("oklab-")));
        assert_eq!(engine.metrics().snapshot().stages.coordination_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_cost_estimate_uses_fallback_strategy() {
        let engine = engine_with(vec![Arc::new(UnpricedStrategy) as Arc<dyn ColorStrategy>], EngineConfig::default());

        let first = tokio::time::timeout(Duration::from_secs(5), engine.process_colors(red("t1")))
            .await
            .expect("first submission resolves");
        assert_eq!(first.metadata.strategy_name, FallbackStrategy::NAME);
        assert_eq!(engine.state().await, EngineState::Idle);

        let green = ColorContext::new("t2", [("VIBRANT", "#00ff00")]);
        let second = tokio::time::timeout(Duration::from_secs(5), engine.process_colors(green))
            .await
            .expect("second submission resolves");
        assert_eq!(second.metadata.strategy_name, FallbackStrategy::NAME);
        assert_eq!(engine.metrics().snapshot().stages.selection_failures, 2);
    }

    #[tokio::test]
    async fn test_panic_outside_strategies_releases_engine() {
        let engine = ColorEngine::builder()
            .selector(Arc::new(
                RegistrySelector::new().with_strategy(Arc::new(Probe::new("plain", Behavior::Passthrough))),
            ))
            .probe(Arc::new(BrokenProbe))
            .build()
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), engine.process_colors(red("t1")))
            .await
            .expect("first submission resolves");
        assert!(first.is_fallback());
        assert_eq!(engine.state().await, EngineState::Idle);

        let second = tokio::time::timeout(Duration::from_secs(5), engine.process_colors(red("t2")))
            .await
            .expect("second submission resolves");
        assert!(second.is_fallback());
        assert_eq!(engine.metrics().snapshot().fallback_count, 2);
    }

    #[tokio::test]
    async fn test_slot_release_frees_queue_when_driver_dies() {
        let engine = ColorEngine::builder().build().unwrap();
        let (waiting, rx) = PendingWork::new(red("queued"));
        {
            let mut state = engine.inner.state.lock().await;
            state.is_processing = true;
            state.queue.push(waiting);
        }

        drop(SlotRelease::new(Arc::clone(&engine.inner)));

        assert!(rx.await.unwrap().is_fallback());
        assert_eq!(engine.state().await, EngineState::Idle);
        assert_eq!(engine.queue_len().await, 0);

        let mut disarmed = SlotRelease::new(Arc::clone(&engine.inner));
        engine.inner.state.lock().await.is_processing = true;
        disarmed.disarm();
        drop(disarmed);
        assert_eq!(engine.state().await, EngineState::Processing);
    }

    #[tokio::test]
    async fn test_settings_change_invalidates_cache() {
        let settings = Arc::new(MemorySettings::new());
        let probe = Arc::new(Probe::new("spy", Behavior::Passthrough));
        let calls = Arc::clone(&probe.calls);
        let engine = ColorEngine::builder()
            .selector(Arc::new(RegistrySelector::new().with_strategy(probe)))
            .settings(settings.clone())
            .build()
            .unwrap();
        engine.init().unwrap();

        engine.process_colors(red("t1")).await;
        assert_eq!(engine.cache_len().await, 1);

        settings.set(settings::KEY_QUALITY, json!("quality"));
        tokio::task::yield_now().await;
        assert_eq!(engine.cache_len().await, 1);

        settings.set(settings::KEY_ACCENT, json!("mauve"));
        let probe_engine = engine.clone();
        wait_until(|| {
            let engine = probe_engine.clone();
            async move { engine.cache_len().await == 0 }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window_per_track() {
        let probe = Arc::new(Probe::new("spy", Behavior::Passthrough));
        let calls = Arc::clone(&probe.calls);
        let engine = engine_with(vec![probe as Arc<dyn ColorStrategy>], EngineConfig::default());

        let first = engine.process_colors(red("t1")).await;

        tokio::time::advance(Duration::from_millis(500)).await;
        let blue = ColorContext::new("t1", [("VIBRANT", "#0000ff")]);
        let deduped = engine.process_colors(blue.clone()).await;
        assert_eq!(deduped, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.dedup_hit_count, 1);
        assert_eq!(snapshot.extraction_count, 1);

        tokio::time::advance(Duration::from_millis(2000)).await;
        let fresh = engine.process_colors(blue).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(fresh.processed_colors, first.processed_colors);
    }

    #[tokio::test]
    async fn test_queue_keeps_newest_contexts() {
        let gated = Arc::new(Probe::new("gated", Behavior::Gated));
        let gate = Arc::clone(&gated.gate);
        let calls = Arc::clone(&gated.calls);
        let config = EngineConfig::default();
        let max = config.max_queue_size;
        let engine = engine_with(vec![gated as Arc<dyn ColorStrategy>], config);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process_colors(red("t0")).await })
        };
        let probe_engine = engine.clone();
        wait_until(|| {
            let engine = probe_engine.clone();
            async move { engine.state().await == EngineState::Processing }
        })
        .await;

        let mut waiters = Vec::new();
        for i in 1..=max + 3 {
            let submitter = engine.clone();
            let context = ColorContext::new(format!("t{}", i), [("VIBRANT", format!("#0000{:02x}", i))]);
            waiters.push(tokio::spawn(async move { submitter.process_colors(context).await }));

            // Wait for each submission to land so queue order is deterministic
            let expected_queued = i.min(max);
            let expected_dropped = i.saturating_sub(max) as u64;
            wait_until(|| {
                let engine = probe_engine.clone();
                async move {
                    engine.queue_len().await == expected_queued
                        && engine.metrics().snapshot().dropped_count == expected_dropped
                }
            })
            .await;
        }

        let expected: Vec<String> = (4..=max + 3).map(|i| format!("t{}", i)).collect();
        assert_eq!(engine.pending_track_ids().await, expected);
        assert_eq!(engine.metrics().snapshot().dropped_count, 3);

        gate.add_permits(100);
        assert!(!first.await.unwrap().is_fallback());
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1 + max);
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_recovers_from_hung_strategy() {
        let hung = Arc::new(Probe::new("hung", Behavior::Hang));
        let calls = Arc::clone(&hung.calls);
        let bus = Arc::new(MemoryEventBus::new());
        let mut harmonized = bus.subscribe(Topic::ColorsHarmonized, "test");
        let engine = ColorEngine::builder()
            .selector(Arc::new(RegistrySelector::new().with_strategy(hung)))
            .event_bus(bus)
            .build()
            .unwrap();

        let result = engine.process_colors(red("t1")).await;
        assert!(result.is_fallback());
        assert_eq!(engine.state().await, EngineState::Idle);
        assert!(harmonized.try_recv().is_err());

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.timeout_count, 1);
        let runs = snapshot.stages.strategy_runs;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(engine.metrics().snapshot().stages.strategy_runs, runs);

        // A later submission runs a fresh cycle
        engine.process_colors(red("t2")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.metrics().snapshot().timeout_count, 2);
    }

    #[tokio::test]
    async fn test_extracted_events_are_processed_and_published() {
        let bus = Arc::new(MemoryEventBus::new());
        let mut harmonized = bus.subscribe(Topic::ColorsHarmonized, "ui");
        let engine = ColorEngine::builder().event_bus(bus.clone()).build().unwrap();
        engine.init().unwrap();

        bus.publish(BusEvent::ColorsExtracted(ColorsExtractedEvent {
            raw_colors: [("VIBRANT".to_string(), "#FF0000".to_string())].into_iter().collect(),
            track_id: "t1".to_string(),
            music_data: Some(MusicData::new(0.9, 0.7)),
            timestamp: None,
        }));

        let event = match harmonized.recv().await {
            Some(BusEvent::ColorsHarmonized(event)) => event,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(event.accent_hex, "#ff0000");
        assert!(event.processed_colors.contains_key("oklab-VIBRANT"));

        engine.dispose().await;
        assert_eq!(bus.subscriber_count(Topic::ColorsExtracted), 0);
    }

    #[tokio::test]
    async fn test_disposed_engine_returns_fallback() {
        let engine = ColorEngine::builder().build().unwrap();
        engine.init().unwrap();
        engine.dispose().await;

        let result = engine.process_colors(red("t1")).await;
        assert!(result.is_fallback());
        assert_eq!(engine.state().await, EngineState::Disposed);
        assert!(engine.init().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(ColorEngine::builder().config(config).build().is_err());
    }
}
