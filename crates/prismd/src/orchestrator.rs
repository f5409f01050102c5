//! Orchestrator: owns the adaptation loop state and drives cycles.
//!
//! Lifecycle is `idle -> running <-> paused -> stopped`. Cycles are
//! triggered by the periodic timer, by mode-change / prompt / preset
//! interactions, and (with 50% probability) by high-intensity interactions.
//! Event triggers bypass the timer without resetting it. Only a running
//! loop reacts to triggers; timer ticks that pile up behind a slow cycle
//! collapse into one.

use prism_shared::{
    AdaptationSummary, Beat, Clock, Decision, EventKind, InteractionEvent, InteractionKind, Mode,
    ModeCatalog, OrchestratorEvent, OrchestratorStatus, PrismError, QuantumTrigger, RenderState,
    StateAnalysis, TelemetrySnapshot, INTERACTION_BUFFER_SIZE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::analyzer::{AnalyzerConfig, StateAnalyzer};
use crate::cache::lock;
use crate::collaborators::{
    AudioCollaborator, HeadlessAudio, HeadlessUi, HeadlessVisual, UiCollaborator,
    VisualCollaborator,
};
use crate::config::AdaptationConfig;
use crate::decision::{DecisionEngine, DecisionRecord, PromptInterpretation};
use crate::events::{EventBus, Listener, ListenerId};
use crate::quantum::QuantumEngine;
use crate::timer::PeriodicTimer;

/// Adaptation records kept
pub const MAX_ADAPTATION_HISTORY: usize = 20;

/// Cycles are skipped below this adaptation level
pub const MIN_ADAPTATION_LEVEL: f64 = 0.1;

/// Chance that a high-intensity interaction triggers a cycle
const HIGH_INTENSITY_TRIGGER_PROBABILITY: f64 = 0.5;

/// Transition length when entering a mode
const MODE_TRANSITION_SECS: f64 = 2.0;

pub struct Collaborators {
    pub visual: Arc<dyn VisualCollaborator>,
    pub audio: Arc<dyn AudioCollaborator>,
    pub ui: Arc<dyn UiCollaborator>,
}

impl Collaborators {
    pub fn new(
        visual: Arc<dyn VisualCollaborator>,
        audio: Arc<dyn AudioCollaborator>,
        ui: Arc<dyn UiCollaborator>,
    ) -> Self {
        Self { visual, audio, ui }
    }

    /// In-memory collaborators that only log
    pub fn headless() -> Self {
        Self::new(
            Arc::new(HeadlessVisual::new()),
            Arc::new(HeadlessAudio::new()),
            Arc::new(HeadlessUi),
        )
    }
}

/// One completed (possibly partially failed) adaptation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationRecord {
    pub timestamp_ms: u64,
    pub analysis: StateAnalysis,
    pub decision: Decision,
    /// Sub-changes that failed, as "<branch>: <error>"
    pub failed_changes: Vec<String>,
}

impl AdaptationRecord {
    pub fn succeeded(&self) -> bool {
        self.failed_changes.is_empty()
    }
}

/// Everything the orchestrator mutates, behind one lock
struct LoopState {
    status: OrchestratorStatus,
    current_mode: String,
    adaptation_period: Duration,
    adaptation_level: f64,
    quantum_randomness: f64,
    session_start_ms: u64,
    last_interaction_ms: Option<u64>,
    interactions: VecDeque<InteractionEvent>,
    history: VecDeque<AdaptationRecord>,
}

pub struct Orchestrator {
    state: Mutex<LoopState>,
    catalog: ModeCatalog,
    default_period: Duration,
    analyzer: StateAnalyzer,
    engine: DecisionEngine,
    quantum: Arc<QuantumEngine>,
    collaborators: Collaborators,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    timer: Mutex<PeriodicTimer>,
    /// Holds at most one pending tick
    tick: Arc<Notify>,
    loop_active: AtomicBool,
    /// One apply at a time
    apply_gate: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: &AdaptationConfig,
        engine: DecisionEngine,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PrismError> {
        Self::with_catalog(config, ModeCatalog::default(), engine, collaborators, clock)
    }

    pub fn with_catalog(
        config: &AdaptationConfig,
        catalog: ModeCatalog,
        engine: DecisionEngine,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PrismError> {
        let mode = catalog
            .get(&config.initial_mode)
            .ok_or_else(|| PrismError::UnknownMode(config.initial_mode.clone()))?;
        let default_period = config.adaptation_period();
        let period = mode_period(mode, default_period);

        let tick = Arc::new(Notify::new());
        let notify = Arc::clone(&tick);
        let timer = PeriodicTimer::new(period, move || notify.notify_one());

        let quantum = Arc::new(QuantumEngine::new(
            Arc::clone(&collaborators.visual),
            Arc::clone(&collaborators.audio),
            Arc::clone(&clock),
            config.quantum_randomness,
            config.seed.map(|s| s.wrapping_add(2)),
        ));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        let (shutdown, _) = watch::channel(false);

        let state = LoopState {
            status: OrchestratorStatus::Idle,
            current_mode: mode.name.clone(),
            adaptation_period: period,
            adaptation_level: config.adaptation_level.clamp(0.0, 1.0),
            quantum_randomness: config.quantum_randomness.clamp(0.0, 1.0),
            session_start_ms: clock.now_ms(),
            last_interaction_ms: None,
            interactions: VecDeque::with_capacity(INTERACTION_BUFFER_SIZE),
            history: VecDeque::with_capacity(MAX_ADAPTATION_HISTORY),
        };

        Ok(Self {
            state: Mutex::new(state),
            catalog,
            default_period,
            analyzer: StateAnalyzer::new(AnalyzerConfig::from(config)),
            engine,
            quantum,
            collaborators,
            bus: Arc::new(EventBus::new()),
            clock,
            rng: Mutex::new(rng),
            timer: Mutex::new(timer),
            tick,
            loop_active: AtomicBool::new(false),
            apply_gate: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    // ------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------

    pub fn status(&self) -> OrchestratorStatus {
        lock(&self.state).status
    }

    pub fn current_mode(&self) -> String {
        lock(&self.state).current_mode.clone()
    }

    pub fn adaptation_period(&self) -> Duration {
        lock(&self.state).adaptation_period
    }

    pub fn adaptation_level(&self) -> f64 {
        lock(&self.state).adaptation_level
    }

    pub fn quantum_randomness(&self) -> f64 {
        lock(&self.state).quantum_randomness
    }

    /// Oldest first
    pub fn history(&self) -> Vec<AdaptationRecord> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn decision_history(&self) -> Vec<DecisionRecord> {
        self.engine.history()
    }

    /// Buffered interactions, oldest first
    pub fn interactions(&self) -> Vec<InteractionEvent> {
        lock(&self.state).interactions.iter().cloned().collect()
    }

    pub fn catalog(&self) -> &ModeCatalog {
        &self.catalog
    }

    pub fn quantum(&self) -> &QuantumEngine {
        &self.quantum
    }

    /// Timer period and whether it is ticking
    pub fn timer_state(&self) -> (Duration, bool) {
        let timer = lock(&self.timer);
        (timer.period(), timer.is_running())
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.bus.subscribe(listener)
    }

    pub fn subscribe_to(&self, kinds: &[EventKind], listener: Arc<dyn Listener>) -> ListenerId {
        self.bus.subscribe_to(kinds, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn set_adaptation_level(&self, level: f64) {
        let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
        lock(&self.state).adaptation_level = level;
        debug!("Adaptation level set to {:.2}", level);
    }

    pub fn set_quantum_randomness(&self, randomness: f64) {
        let randomness = if randomness.is_finite() {
            randomness.clamp(0.0, 1.0)
        } else {
            0.0
        };
        lock(&self.state).quantum_randomness = randomness;
        self.quantum.set_randomness(randomness);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enter the initial mode and start the periodic timer
    pub async fn start(&self) -> Result<(), PrismError> {
        let mode_name = {
            let mut state = lock(&self.state);
            if state.status != OrchestratorStatus::Idle {
                return Err(PrismError::InvalidState(format!(
                    "cannot start from {:?}",
                    state.status
                )));
            }
            state.status = OrchestratorStatus::Running;
            state.session_start_ms = self.clock.now_ms();
            state.current_mode.clone()
        };

        if let Some(mode) = self.catalog.get(&mode_name) {
            if let Err(e) = self.apply_mode_presets(mode).await {
                warn!("Initial mode presets not fully applied: {}", e);
            }
        }

        let period = self.adaptation_period();
        lock(&self.timer).restart(period);
        info!("Orchestrator started in {} mode ({}ms period)", mode_name, period.as_millis());
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PrismError> {
        self.transition(OrchestratorStatus::Running, OrchestratorStatus::Paused)?;
        lock(&self.timer).stop();
        info!("Orchestrator paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PrismError> {
        self.transition(OrchestratorStatus::Paused, OrchestratorStatus::Running)?;
        let period = self.adaptation_period();
        lock(&self.timer).restart(period);
        info!("Orchestrator resumed");
        Ok(())
    }

    /// Terminal. Pending quantum reversals still run.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if state.status == OrchestratorStatus::Stopped {
                return;
            }
            state.status = OrchestratorStatus::Stopped;
        }
        lock(&self.timer).stop();
        let _ = self.shutdown.send(true);
        info!("Orchestrator stopped");
    }

    fn transition(&self, from: OrchestratorStatus, to: OrchestratorStatus) -> Result<(), PrismError> {
        let mut state = lock(&self.state);
        if state.status != from {
            return Err(PrismError::InvalidState(format!(
                "cannot go to {:?} from {:?}",
                to, state.status
            )));
        }
        state.status = to;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------

    /// Switch mode. Unknown names are rejected before anything changes.
    /// Returns false when already in that mode.
    pub async fn set_mode(&self, name: &str) -> Result<bool, PrismError> {
        let Some(mode) = self.change_mode(name)? else {
            return Ok(false);
        };
        if let Err(e) = self.apply_mode_presets(&mode).await {
            warn!("Mode {} presets not fully applied: {}", mode.name, e);
        }
        Ok(true)
    }

    /// Update state, restart the timer if the period changed, notify
    fn change_mode(&self, name: &str) -> Result<Option<Mode>, PrismError> {
        let Some(mode) = self.catalog.get(name).cloned() else {
            warn!("Rejected unknown mode {}", name);
            return Err(PrismError::UnknownMode(name.to_string()));
        };

        let period = mode_period(&mode, self.default_period);
        let (from, restart) = {
            let mut state = lock(&self.state);
            if state.status == OrchestratorStatus::Stopped {
                return Err(PrismError::InvalidState("orchestrator stopped".to_string()));
            }
            if state.current_mode == mode.name {
                return Ok(None);
            }
            let from = std::mem::replace(&mut state.current_mode, mode.name.clone());
            let changed = state.adaptation_period != period;
            state.adaptation_period = period;
            (from, changed && state.status == OrchestratorStatus::Running)
        };

        {
            let mut timer = lock(&self.timer);
            if restart {
                timer.restart(period);
            } else {
                timer.set_period(period);
            }
        }

        info!("Mode {} -> {} ({}ms period)", from, mode.name, period.as_millis());
        self.bus.publish(&OrchestratorEvent::ModeChanged {
            from,
            to: mode.name.clone(),
        });
        Ok(Some(mode))
    }

    async fn apply_mode_presets(&self, mode: &Mode) -> Result<(), PrismError> {
        let visual = &self.collaborators.visual;
        let audio = &self.collaborators.audio;
        let (switched, visual_result, audio_result) = tokio::join!(
            visual.set_fractal_type(&mode.visual_preset),
            visual.transition_parameters(&mode.visual, MODE_TRANSITION_SECS),
            audio.transition_parameters(&mode.audio, MODE_TRANSITION_SECS),
        );
        debug!("Mode {} audio preset {}", mode.name, mode.audio_preset);
        if !switched {
            return Err(PrismError::Collaborator(format!(
                "fractal type {} rejected",
                mode.visual_preset
            )));
        }
        visual_result?;
        audio_result
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Record an interaction and run any cycle it triggers
    pub async fn handle_interaction(&self, mut event: InteractionEvent) -> Option<AdaptationRecord> {
        let now = self.clock.now_ms();
        if event.timestamp_ms == 0 {
            event.timestamp_ms = now;
        }

        let status = {
            let mut state = lock(&self.state);
            if state.status == OrchestratorStatus::Stopped {
                return None;
            }
            if state.interactions.len() >= INTERACTION_BUFFER_SIZE {
                state.interactions.pop_front();
            }
            state.interactions.push_back(event.clone());
            state.last_interaction_ms = Some(
                state
                    .last_interaction_ms
                    .map_or(event.timestamp_ms, |t| t.max(event.timestamp_ms)),
            );
            state.status
        };
        self.analyzer.record_interaction(&event);

        if status == OrchestratorStatus::Running {
            self.spawn_quantum(QuantumTrigger::Interaction {
                kind: event.kind.clone(),
                intensity: event.intensity,
            });
        }

        match (&event.kind, event.text.as_deref()) {
            (InteractionKind::ModeChange, Some(name)) => {
                if let Err(e) = self.set_mode(name.trim()).await {
                    warn!("Mode change request ignored: {}", e);
                }
            }
            (InteractionKind::AiPrompt, Some(text)) => {
                self.apply_interpretation(self.engine.interpret_prompt(text)).await;
            }
            _ => {}
        }

        let trigger = if status != OrchestratorStatus::Running {
            false
        } else if event.kind.triggers_immediate_cycle() {
            true
        } else if event.is_high_intensity() {
            lock(&self.rng).gen_bool(HIGH_INTENSITY_TRIGGER_PROBABILITY)
        } else {
            false
        };

        if trigger {
            debug!("Interaction {} triggered a cycle", event.kind);
            self.adapt().await
        } else {
            None
        }
    }

    async fn apply_interpretation(&self, interpretation: PromptInterpretation) {
        info!("Prompt interpreted: {}", interpretation.message);
        if let Some(mode) = &interpretation.target_mode {
            if let Err(e) = self.set_mode(mode).await {
                warn!("Prompt mode change failed: {}", e);
            }
        }
        if let Some(fractal) = &interpretation.fractal_type {
            if !self.collaborators.visual.set_fractal_type(fractal).await {
                warn!("Prompt fractal {} rejected", fractal);
            }
        }
        self.collaborators.ui.show_prompt(&interpretation.message);
    }

    /// Audio beat notification
    pub fn handle_beat(&self, beat: Beat) {
        if self.status() == OrchestratorStatus::Running {
            self.spawn_quantum(QuantumTrigger::Beat { energy: beat.energy });
        }
    }

    /// Renderer performance report
    pub fn record_render_state(&self, partial: &RenderState) {
        self.analyzer.record_render_state(partial);
    }

    /// Draw now, mutate in the background
    fn spawn_quantum(&self, trigger: QuantumTrigger) {
        let Some(event) = self.quantum.roll(trigger) else {
            return;
        };
        self.bus
            .publish(&OrchestratorEvent::QuantumEventFired(event.clone()));
        let quantum = Arc::clone(&self.quantum);
        tokio::spawn(async move {
            if let Err(e) = quantum.perform(&event).await {
                warn!("Quantum {} failed: {}", event.effect, e);
            }
        });
    }

    // ------------------------------------------------------------------
    // Adaptation cycle
    // ------------------------------------------------------------------

    /// Run one cycle. None when skipped.
    pub async fn adapt(&self) -> Option<AdaptationRecord> {
        let (status, level) = {
            let state = lock(&self.state);
            (state.status, state.adaptation_level)
        };
        if matches!(status, OrchestratorStatus::Paused | OrchestratorStatus::Stopped) {
            debug!("Cycle skipped: {:?}", status);
            return None;
        }
        if level < MIN_ADAPTATION_LEVEL {
            debug!("Cycle skipped: adaptation level {:.2}", level);
            return None;
        }

        let snapshot = self.snapshot().await;
        let analysis = self.analyzer.analyze(&snapshot);
        let decision = self.engine.decide(&analysis).await;
        let failed_changes = self.apply(&decision).await;

        let record = AdaptationRecord {
            timestamp_ms: snapshot.timestamp_ms,
            analysis,
            decision,
            failed_changes,
        };
        {
            let mut state = lock(&self.state);
            if state.history.len() >= MAX_ADAPTATION_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
        }

        if record.succeeded() {
            info!("Cycle complete ({})", record.decision.provenance);
        } else {
            warn!(
                "Cycle complete with {} failed changes: {}",
                record.failed_changes.len(),
                record.failed_changes.join("; ")
            );
        }

        self.bus.publish(&OrchestratorEvent::AdaptationOccurred {
            timestamp_ms: record.timestamp_ms,
            provenance: record.decision.provenance,
            rationale: record.decision.rationale.clone(),
            failed_changes: record.failed_changes.len(),
        });
        Some(record)
    }

    /// Capture telemetry for one cycle
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let visual = self.collaborators.visual.state().await;
        let audio = self.collaborators.audio.state().await;
        let now = self.clock.now_ms();

        let state = lock(&self.state);
        let since = state.last_interaction_ms.unwrap_or(state.session_start_ms);
        let interactions: Vec<InteractionEvent> = state.interactions.iter().cloned().collect();
        let adaptations: Vec<AdaptationSummary> = state
            .history
            .iter()
            .map(|r| AdaptationSummary {
                timestamp_ms: r.timestamp_ms,
                mode: r
                    .decision
                    .target_mode
                    .clone()
                    .unwrap_or_else(|| r.analysis.context.current_mode.clone()),
                provenance: r.decision.provenance,
                rationale: r.decision.rationale.clone(),
            })
            .collect();

        TelemetrySnapshot::new(
            now,
            now.saturating_sub(state.session_start_ms),
            now.saturating_sub(since),
            state.current_mode.clone(),
            state.adaptation_level,
            state.quantum_randomness,
            visual,
            audio,
            &interactions,
            &adaptations,
        )
    }

    /// Apply sub-changes concurrently; returns the ones that failed
    pub async fn apply(&self, decision: &Decision) -> Vec<String> {
        let _gate = self.apply_gate.lock().await;
        let visual = &self.collaborators.visual;
        let audio = &self.collaborators.audio;

        if let Some(ui) = &decision.ui {
            if let Some(prompt) = &ui.prompt {
                self.collaborators.ui.show_prompt(prompt);
            }
            if let Some(id) = &ui.highlight {
                self.collaborators.ui.highlight_element(id);
            }
        }

        let mode_change = async {
            let Some(name) = &decision.target_mode else {
                return Ok(());
            };
            match self.change_mode(name) {
                Ok(Some(mode)) => self.apply_mode_presets(&mode).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };

        let fractal_type = async {
            let Some(name) = decision.fractal.as_ref().and_then(|f| f.fractal_type.as_ref()) else {
                return Ok(());
            };
            if visual.set_fractal_type(name).await {
                Ok(())
            } else {
                Err(PrismError::Collaborator(format!("fractal type {} rejected", name)))
            }
        };

        let fractal_params = async {
            match &decision.fractal {
                Some(f) if !f.parameters.is_empty() => {
                    visual.transition_parameters(&f.parameters, f.duration_secs).await
                }
                _ => Ok(()),
            }
        };

        let audio_params = async {
            match &decision.audio {
                Some(a) if !a.parameters.is_empty() => {
                    audio.transition_parameters(&a.parameters, a.duration_secs).await
                }
                _ => Ok(()),
            }
        };

        let (mode_result, type_result, params_result, audio_result) =
            tokio::join!(mode_change, fractal_type, fractal_params, audio_params);

        [
            ("mode", mode_result),
            ("fractal_type", type_result),
            ("fractal_parameters", params_result),
            ("audio", audio_result),
        ]
        .into_iter()
        .filter_map(|(branch, result)| result.err().map(|e| format!("{}: {}", branch, e)))
        .collect()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Drive the loop from timer ticks, interactions and beats until `stop()`
    pub async fn run(
        self: Arc<Self>,
        mut inputs: mpsc::Receiver<InteractionEvent>,
        mut beats: mpsc::Receiver<Beat>,
    ) -> Result<(), PrismError> {
        if self.loop_active.swap(true, Ordering::SeqCst) {
            return Err(PrismError::InvalidState(
                "event loop already running".to_string(),
            ));
        }
        let result = Arc::clone(&self).event_loop(&mut inputs, &mut beats).await;
        self.loop_active.store(false, Ordering::SeqCst);
        result
    }

    async fn event_loop(
        self: Arc<Self>,
        inputs: &mut mpsc::Receiver<InteractionEvent>,
        beats: &mut mpsc::Receiver<Beat>,
    ) -> Result<(), PrismError> {
        let mut shutdown = self.shutdown.subscribe();

        match self.status() {
            OrchestratorStatus::Idle => self.start().await?,
            OrchestratorStatus::Stopped => return Ok(()),
            _ => {}
        }

        let mut inputs_open = true;
        let mut beats_open = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.tick.notified() => {
                    if self.status() != OrchestratorStatus::Running {
                        continue;
                    }
                    let orchestrator = Arc::clone(&self);
                    guarded("timer cycle", async move {
                        orchestrator.adapt().await;
                    })
                    .await;
                }
                event = inputs.recv(), if inputs_open => match event {
                    Some(event) => {
                        let orchestrator = Arc::clone(&self);
                        guarded("interaction", async move {
                            orchestrator.handle_interaction(event).await;
                        })
                        .await;
                    }
                    None => {
                        debug!("Interaction source closed");
                        inputs_open = false;
                    }
                },
                beat = beats.recv(), if beats_open => match beat {
                    Some(beat) => self.handle_beat(beat),
                    None => {
                        debug!("Beat source closed");
                        beats_open = false;
                    }
                },
            }
        }

        info!("Event loop finished");
        Ok(())
    }
}

/// Run a trigger in its own task so a panic cannot end the loop
async fn guarded<F>(what: &str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(fut).await {
        error!("{} aborted: {}", what, e);
    }
}

fn mode_period(mode: &Mode, default: Duration) -> Duration {
    if mode.adaptation_period_ms > 0 {
        Duration::from_millis(mode.adaptation_period_ms)
    } else {
        default
    }
}
