//! Telemetry types: interaction events, collaborator state and the
//! per-cycle snapshot handed to the analyzer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decision::Provenance;

/// Interaction events kept in a snapshot
pub const MAX_SNAPSHOT_INTERACTIONS: usize = 20;

/// Adaptation summaries kept in a snapshot
pub const MAX_SNAPSHOT_ADAPTATIONS: usize = 5;

/// Interaction ring buffer size
pub const INTERACTION_BUFFER_SIZE: usize = 100;

/// Intensity above which an interaction counts as high-intensity
pub const HIGH_INTENSITY: f64 = 0.8;

// ============================================================================
// Interaction events
// ============================================================================

/// Interaction type tag. Serialised as a plain string ("drag", "ai_prompt", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InteractionKind {
    Drag,
    Click,
    Zoom,
    Rotate,
    Scroll,
    KeyPress,
    PresetSelect,
    Preset,
    ModeChange,
    AiPrompt,
    Other(String),
}

impl InteractionKind {
    pub fn as_str(&self) -> &str {
        match self {
            InteractionKind::Drag => "drag",
            InteractionKind::Click => "click",
            InteractionKind::Zoom => "zoom",
            InteractionKind::Rotate => "rotate",
            InteractionKind::Scroll => "scroll",
            InteractionKind::KeyPress => "key_press",
            InteractionKind::PresetSelect => "preset_select",
            InteractionKind::Preset => "preset",
            InteractionKind::ModeChange => "mode_change",
            InteractionKind::AiPrompt => "ai_prompt",
            InteractionKind::Other(s) => s,
        }
    }

    /// Mode changes, AI prompts and preset picks always trigger a cycle
    pub fn triggers_immediate_cycle(&self) -> bool {
        matches!(
            self,
            InteractionKind::ModeChange
                | InteractionKind::AiPrompt
                | InteractionKind::Preset
                | InteractionKind::PresetSelect
        )
    }
}

impl From<String> for InteractionKind {
    fn from(s: String) -> Self {
        match s.to_lowercase().replace('-', "_").as_str() {
            "drag" => InteractionKind::Drag,
            "click" => InteractionKind::Click,
            "zoom" => InteractionKind::Zoom,
            "rotate" => InteractionKind::Rotate,
            "scroll" => InteractionKind::Scroll,
            "key_press" | "keypress" => InteractionKind::KeyPress,
            "preset_select" => InteractionKind::PresetSelect,
            "preset" => InteractionKind::Preset,
            "mode_change" => InteractionKind::ModeChange,
            "ai_prompt" | "prompt" => InteractionKind::AiPrompt,
            _ => InteractionKind::Other(s),
        }
    }
}

impl From<&str> for InteractionKind {
    fn from(s: &str) -> Self {
        InteractionKind::from(s.to_string())
    }
}

impl From<InteractionKind> for String {
    fn from(kind: InteractionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalised 2-D position, both axes in [0,1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single user interaction. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub intensity: Option<f64>,
    /// Free text for prompt-style interactions
    #[serde(default)]
    pub text: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl InteractionEvent {
    pub fn new(kind: impl Into<InteractionKind>, timestamp_ms: u64) -> Self {
        Self {
            kind: kind.into(),
            position: None,
            intensity: None,
            text: None,
            timestamp_ms,
        }
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = Some(intensity.clamp(0.0, 1.0));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn is_high_intensity(&self) -> bool {
        self.intensity.map(|i| i > HIGH_INTENSITY).unwrap_or(false)
    }
}

// ============================================================================
// Visual state
// ============================================================================

/// Full fractal parameter set as reported by the visual collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualParameters {
    pub zoom: f64,
    /// Radians
    pub rotation: f64,
    pub iterations: u32,
    pub color_shift: f64,
    pub center_x: f64,
    pub center_y: f64,
    /// Fourth-dimension slice for hypercomplex fractals
    pub dimension: f64,
}

impl Default for VisualParameters {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            rotation: 0.0,
            iterations: 100,
            color_shift: 0.0,
            center_x: 0.0,
            center_y: 0.0,
            dimension: 0.0,
        }
    }
}

/// Partial visual parameters: only set fields are changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_shift: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<f64>,
}

impl VisualPatch {
    pub fn is_empty(&self) -> bool {
        *self == VisualPatch::default()
    }

    /// Apply set fields on top of `base`
    pub fn apply_to(&self, base: &VisualParameters) -> VisualParameters {
        VisualParameters {
            zoom: self.zoom.unwrap_or(base.zoom),
            rotation: self.rotation.unwrap_or(base.rotation),
            iterations: self.iterations.unwrap_or(base.iterations),
            color_shift: self.color_shift.unwrap_or(base.color_shift),
            center_x: self.center_x.unwrap_or(base.center_x),
            center_y: self.center_y.unwrap_or(base.center_y),
            dimension: self.dimension.unwrap_or(base.dimension),
        }
    }
}

/// Visual collaborator state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualState {
    pub fractal_type: String,
    pub parameters: VisualParameters,
}

impl Default for VisualState {
    fn default() -> Self {
        Self {
            fractal_type: "mandelbrot".to_string(),
            parameters: VisualParameters::default(),
        }
    }
}

// ============================================================================
// Audio state
// ============================================================================

/// Full synthesis parameter set as reported by the audio collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParameters {
    /// Beats per minute
    pub tempo: f64,
    pub volume: f64,
    /// Hz
    pub base_frequency: f64,
    /// Hz offset between channels, 0 disables
    pub binaural_beat: f64,
    pub rhythm_enabled: bool,
    pub harmonic_ratio: f64,
    pub reverb: f64,
}

impl Default for AudioParameters {
    fn default() -> Self {
        Self {
            tempo: 80.0,
            volume: 0.6,
            base_frequency: 220.0,
            binaural_beat: 0.0,
            rhythm_enabled: false,
            harmonic_ratio: 1.5,
            reverb: 0.3,
        }
    }
}

/// Partial audio parameters: only set fields are changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binaural_beat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhythm_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harmonic_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverb: Option<f64>,
}

impl AudioPatch {
    pub fn is_empty(&self) -> bool {
        *self == AudioPatch::default()
    }

    pub fn apply_to(&self, base: &AudioParameters) -> AudioParameters {
        AudioParameters {
            tempo: self.tempo.unwrap_or(base.tempo),
            volume: self.volume.unwrap_or(base.volume),
            base_frequency: self.base_frequency.unwrap_or(base.base_frequency),
            binaural_beat: self.binaural_beat.unwrap_or(base.binaural_beat),
            rhythm_enabled: self.rhythm_enabled.unwrap_or(base.rhythm_enabled),
            harmonic_ratio: self.harmonic_ratio.unwrap_or(base.harmonic_ratio),
            reverb: self.reverb.unwrap_or(base.reverb),
        }
    }
}

/// Live analysis reported by the audio engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysis {
    /// Overall signal energy in [0,1]
    pub energy: f64,
    /// Hz
    pub dominant_frequency: f64,
}

/// Audio collaborator state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioState {
    pub parameters: AudioParameters,
    pub analysis: AudioAnalysis,
}

/// Beat notification emitted by the audio collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    pub energy: f64,
    pub timestamp_ms: u64,
}

// ============================================================================
// Render state
// ============================================================================

/// Renderer performance figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderState {
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub frame_time_ms: Option<f64>,
}

impl RenderState {
    /// Merge set fields of `partial` into self
    pub fn merge(&mut self, partial: &RenderState) {
        if partial.fps.is_some() {
            self.fps = partial.fps;
        }
        if partial.frame_time_ms.is_some() {
            self.frame_time_ms = partial.frame_time_ms;
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Short record of a past adaptation, carried in snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationSummary {
    pub timestamp_ms: u64,
    pub mode: String,
    pub provenance: Provenance,
    pub rationale: String,
}

/// Telemetry captured at the start of one adaptation cycle.
/// Built fresh each cycle and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp_ms: u64,
    pub session_duration_ms: u64,
    pub time_since_last_interaction_ms: u64,
    pub current_mode: String,
    pub adaptation_level: f64,
    pub quantum_randomness: f64,
    pub visual: VisualState,
    pub audio: AudioState,
    #[serde(default)]
    pub render: RenderState,
    pub recent_interactions: Vec<InteractionEvent>,
    pub recent_adaptations: Vec<AdaptationSummary>,
}

impl TelemetrySnapshot {
    /// Build a snapshot, keeping only the newest interactions and adaptations
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp_ms: u64,
        session_duration_ms: u64,
        time_since_last_interaction_ms: u64,
        current_mode: impl Into<String>,
        adaptation_level: f64,
        quantum_randomness: f64,
        visual: VisualState,
        audio: AudioState,
        recent_interactions: &[InteractionEvent],
        recent_adaptations: &[AdaptationSummary],
    ) -> Self {
        Self {
            timestamp_ms,
            session_duration_ms,
            time_since_last_interaction_ms,
            current_mode: current_mode.into(),
            adaptation_level: adaptation_level.clamp(0.0, 1.0),
            quantum_randomness: quantum_randomness.clamp(0.0, 1.0),
            visual,
            audio,
            render: RenderState::default(),
            recent_interactions: tail(recent_interactions, MAX_SNAPSHOT_INTERACTIONS),
            recent_adaptations: tail(recent_adaptations, MAX_SNAPSHOT_ADAPTATIONS),
        }
    }

    pub fn with_render(mut self, render: RenderState) -> Self {
        self.render = render;
        self
    }
}

fn tail<T: Clone>(items: &[T], max: usize) -> Vec<T> {
    let start = items.len().saturating_sub(max);
    items[start..].to_vec()
}
