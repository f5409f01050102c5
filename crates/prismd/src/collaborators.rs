//! Collaborator seams: the renderer, the synthesiser and the UI.
//!
//! The core only ever talks to these traits. `Headless*` implementations
//! keep state in memory and log side effects (used by the daemon);
//! `Recording*` fakes record every call for tests.

use async_trait::async_trait;
use prism_shared::{
    AudioParameters, AudioPatch, AudioState, PrismError, VisualParameters, VisualPatch,
    VisualState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::lock;
use crate::decision::FRACTAL_TYPES;

/// Interpolation steps used by headless transitions
const TRANSITION_STEPS: u32 = 10;

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait VisualCollaborator: Send + Sync {
    async fn state(&self) -> VisualState;

    /// False when the fractal type is unknown to the renderer
    async fn set_fractal_type(&self, name: &str) -> bool;

    async fn set_parameters(&self, patch: &VisualPatch) -> Result<(), PrismError>;

    /// Interpolate towards `patch` over `duration_secs`
    async fn transition_parameters(
        &self,
        patch: &VisualPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError>;
}

#[async_trait]
pub trait AudioCollaborator: Send + Sync {
    async fn state(&self) -> AudioState;

    async fn set_parameters(&self, patch: &AudioPatch) -> Result<(), PrismError>;

    async fn transition_parameters(
        &self,
        patch: &AudioPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError>;
}

/// Fire-and-forget UI directives
pub trait UiCollaborator: Send + Sync {
    fn show_prompt(&self, text: &str);
    fn highlight_element(&self, id: &str);
}

// ============================================================================
// Interpolation
// ============================================================================

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + (to - from) * t
}

fn lerp_visual(from: &VisualParameters, to: &VisualParameters, t: f64) -> VisualParameters {
    VisualParameters {
        zoom: lerp(from.zoom, to.zoom, t),
        rotation: lerp(from.rotation, to.rotation, t),
        iterations: lerp(from.iterations as f64, to.iterations as f64, t).round() as u32,
        color_shift: lerp(from.color_shift, to.color_shift, t),
        center_x: lerp(from.center_x, to.center_x, t),
        center_y: lerp(from.center_y, to.center_y, t),
        dimension: lerp(from.dimension, to.dimension, t),
    }
}

fn lerp_audio(from: &AudioParameters, to: &AudioParameters, t: f64) -> AudioParameters {
    AudioParameters {
        tempo: lerp(from.tempo, to.tempo, t),
        volume: lerp(from.volume, to.volume, t),
        base_frequency: lerp(from.base_frequency, to.base_frequency, t),
        binaural_beat: lerp(from.binaural_beat, to.binaural_beat, t),
        rhythm_enabled: if t >= 1.0 { to.rhythm_enabled } else { from.rhythm_enabled },
        harmonic_ratio: lerp(from.harmonic_ratio, to.harmonic_ratio, t),
        reverb: lerp(from.reverb, to.reverb, t),
    }
}

fn step_delay(duration_secs: f64) -> Duration {
    if duration_secs.is_finite() && duration_secs > 0.0 {
        Duration::from_secs_f64(duration_secs / TRANSITION_STEPS as f64)
    } else {
        Duration::ZERO
    }
}

// ============================================================================
// Headless (daemon)
// ============================================================================

/// In-memory renderer stand-in
#[derive(Default)]
pub struct HeadlessVisual {
    state: Mutex<VisualState>,
}

impl HeadlessVisual {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VisualCollaborator for HeadlessVisual {
    async fn state(&self) -> VisualState {
        lock(&self.state).clone()
    }

    async fn set_fractal_type(&self, name: &str) -> bool {
        if !FRACTAL_TYPES.contains(&name) {
            debug!("Unknown fractal type {}", name);
            return false;
        }
        lock(&self.state).fractal_type = name.to_string();
        info!("[visual] fractal -> {}", name);
        true
    }

    async fn set_parameters(&self, patch: &VisualPatch) -> Result<(), PrismError> {
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }

    async fn transition_parameters(
        &self,
        patch: &VisualPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError> {
        let start = lock(&self.state).parameters.clone();
        let target = patch.apply_to(&start);
        let delay = step_delay(duration_secs);
        info!("[visual] transition over {:.1}s: {:?}", duration_secs, patch);

        // Each step rewrites the parameters; a concurrent writer wins until the next step
        for step in 1..=TRANSITION_STEPS {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let t = step as f64 / TRANSITION_STEPS as f64;
            lock(&self.state).parameters = lerp_visual(&start, &target, t);
        }
        Ok(())
    }
}

/// In-memory synthesiser stand-in
#[derive(Default)]
pub struct HeadlessAudio {
    state: Mutex<AudioState>,
}

impl HeadlessAudio {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioCollaborator for HeadlessAudio {
    async fn state(&self) -> AudioState {
        lock(&self.state).clone()
    }

    async fn set_parameters(&self, patch: &AudioPatch) -> Result<(), PrismError> {
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }

    async fn transition_parameters(
        &self,
        patch: &AudioPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError> {
        let start = lock(&self.state).parameters.clone();
        let target = patch.apply_to(&start);
        let delay = step_delay(duration_secs);
        info!("[audio] transition over {:.1}s: {:?}", duration_secs, patch);

        for step in 1..=TRANSITION_STEPS {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let t = step as f64 / TRANSITION_STEPS as f64;
            lock(&self.state).parameters = lerp_audio(&start, &target, t);
        }
        Ok(())
    }
}

/// Logs UI directives
#[derive(Default)]
pub struct HeadlessUi;

impl UiCollaborator for HeadlessUi {
    fn show_prompt(&self, text: &str) {
        info!("[ui] prompt: {}", text);
    }

    fn highlight_element(&self, id: &str) {
        info!("[ui] highlight: {}", id);
    }
}

// ============================================================================
// Recording fakes (tests)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum VisualCall {
    SetFractalType(String),
    SetParameters(VisualPatch),
    Transition(VisualPatch, f64),
}

/// Applies patches instantly and records every call
#[derive(Default)]
pub struct RecordingVisual {
    state: Mutex<VisualState>,
    calls: Mutex<Vec<VisualCall>>,
    fail_transitions: AtomicBool,
}

impl RecordingVisual {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transition fail
    pub fn failing() -> Self {
        let visual = Self::default();
        visual.fail_transitions.store(true, Ordering::SeqCst);
        visual
    }

    pub fn calls(&self) -> Vec<VisualCall> {
        lock(&self.calls).clone()
    }

    pub fn parameters(&self) -> VisualParameters {
        lock(&self.state).parameters.clone()
    }

    pub fn fractal_type(&self) -> String {
        lock(&self.state).fractal_type.clone()
    }
}

#[async_trait]
impl VisualCollaborator for RecordingVisual {
    async fn state(&self) -> VisualState {
        lock(&self.state).clone()
    }

    async fn set_fractal_type(&self, name: &str) -> bool {
        lock(&self.calls).push(VisualCall::SetFractalType(name.to_string()));
        if !FRACTAL_TYPES.contains(&name) {
            return false;
        }
        lock(&self.state).fractal_type = name.to_string();
        true
    }

    async fn set_parameters(&self, patch: &VisualPatch) -> Result<(), PrismError> {
        lock(&self.calls).push(VisualCall::SetParameters(patch.clone()));
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }

    async fn transition_parameters(
        &self,
        patch: &VisualPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError> {
        lock(&self.calls).push(VisualCall::Transition(patch.clone(), duration_secs));
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(PrismError::Collaborator("visual transition failed".to_string()));
        }
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioCall {
    SetParameters(AudioPatch),
    Transition(AudioPatch, f64),
}

#[derive(Default)]
pub struct RecordingAudio {
    state: Mutex<AudioState>,
    calls: Mutex<Vec<AudioCall>>,
    fail_transitions: AtomicBool,
}

impl RecordingAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let audio = Self::default();
        audio.fail_transitions.store(true, Ordering::SeqCst);
        audio
    }

    pub fn calls(&self) -> Vec<AudioCall> {
        lock(&self.calls).clone()
    }

    pub fn parameters(&self) -> AudioParameters {
        lock(&self.state).parameters.clone()
    }
}

#[async_trait]
impl AudioCollaborator for RecordingAudio {
    async fn state(&self) -> AudioState {
        lock(&self.state).clone()
    }

    async fn set_parameters(&self, patch: &AudioPatch) -> Result<(), PrismError> {
        lock(&self.calls).push(AudioCall::SetParameters(patch.clone()));
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }

    async fn transition_parameters(
        &self,
        patch: &AudioPatch,
        duration_secs: f64,
    ) -> Result<(), PrismError> {
        lock(&self.calls).push(AudioCall::Transition(patch.clone(), duration_secs));
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(PrismError::Collaborator("audio transition failed".to_string()));
        }
        let mut state = lock(&self.state);
        state.parameters = patch.apply_to(&state.parameters);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingUi {
    prompts: Mutex<Vec<String>>,
    highlights: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn highlights(&self) -> Vec<String> {
        lock(&self.highlights).clone()
    }
}

impl UiCollaborator for RecordingUi {
    fn show_prompt(&self, text: &str) {
        lock(&self.prompts).push(text.to_string());
    }

    fn highlight_element(&self, id: &str) {
        lock(&self.highlights).push(id.to_string());
    }
}
