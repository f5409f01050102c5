//! Shared types for Prism components.
//!
//! Data model of the adaptation loop: telemetry, analysis results,
//! decisions, modes, notifications and the reasoning wire format.

pub mod analysis;
pub mod clock;
pub mod decision;
pub mod error;
pub mod events;
pub mod mode;
pub mod reasoning;
pub mod telemetry;

pub use analysis::{
    AnalysisContext, Attention, AudioVisualRelationship, Coherence, EngagementAnalysis,
    EngagementFactors, InteractionPattern, InteractionPatternResult, IntervalStats, Issue,
    IssueKind, Recommendation, RecommendationKind, Severity, StateAnalysis, Trend,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{AudioChange, Decision, FractalChange, Provenance, UiDirectives};
pub use error::PrismError;
pub use events::{
    EventKind, OrchestratorEvent, OrchestratorStatus, QuantumEffect, QuantumEvent, QuantumTrigger,
};
pub use mode::{Mode, ModeCatalog};
pub use reasoning::{ChatMessage, ChatRequest, ChatResponse, Usage};
pub use telemetry::{
    AdaptationSummary, AudioAnalysis, AudioParameters, AudioPatch, AudioState, Beat,
    InteractionEvent, InteractionKind, Position, RenderState, TelemetrySnapshot,
    VisualParameters, VisualPatch, VisualState, HIGH_INTENSITY, INTERACTION_BUFFER_SIZE,
    MAX_SNAPSHOT_ADAPTATIONS, MAX_SNAPSHOT_INTERACTIONS,
};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/prism/config.toml";
