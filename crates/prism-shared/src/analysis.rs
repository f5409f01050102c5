//! Analysis results produced by the state analyzer once per cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::telemetry::{AudioParameters, VisualParameters};

// ============================================================================
// Engagement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attention {
    Focused,
    Distracted,
    Passive,
}

/// Contributing factors, each in [0,1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementFactors {
    pub recency: f64,
    pub frequency: f64,
    pub complexity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementAnalysis {
    /// Always in [0,1]
    pub level: f64,
    pub trend: Trend,
    pub attention: Attention,
    pub factors: EngagementFactors,
}

// ============================================================================
// Interaction pattern
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPattern {
    Deliberate,
    Scanning,
    Explorative,
    Focused,
    Chaotic,
    Mixed,
    Minimal,
    InsufficientData,
}

impl InteractionPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionPattern::Deliberate => "deliberate",
            InteractionPattern::Scanning => "scanning",
            InteractionPattern::Explorative => "explorative",
            InteractionPattern::Focused => "focused",
            InteractionPattern::Chaotic => "chaotic",
            InteractionPattern::Mixed => "mixed",
            InteractionPattern::Minimal => "minimal",
            InteractionPattern::InsufficientData => "insufficient_data",
        }
    }

    /// Regular, repeating input
    pub fn is_repetitive(&self) -> bool {
        matches!(self, InteractionPattern::Deliberate | InteractionPattern::Scanning)
    }

    /// Irregular, jumpy input
    pub fn is_erratic(&self) -> bool {
        matches!(self, InteractionPattern::Chaotic)
    }
}

impl fmt::Display for InteractionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inter-event interval statistics, milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalStats {
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    /// Coefficient of variation (std_dev / mean)
    pub cv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPatternResult {
    pub pattern: InteractionPattern,
    pub stats: Option<IntervalStats>,
    pub sample_size: usize,
    pub distinct_types: usize,
}

impl InteractionPatternResult {
    pub fn insufficient(sample_size: usize) -> Self {
        Self {
            pattern: InteractionPattern::InsufficientData,
            stats: None,
            sample_size,
            distinct_types: 0,
        }
    }
}

// ============================================================================
// Audio / visual relationship
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coherence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioVisualRelationship {
    pub audio_intensity: f64,
    pub visual_intensity: f64,
    pub coherence: Coherence,
    /// False when one channel is intense while the other is calm
    pub complementary: bool,
}

impl Default for AudioVisualRelationship {
    fn default() -> Self {
        Self {
            audio_intensity: 0.0,
            visual_intensity: 0.0,
            coherence: Coherence::High,
            complementary: true,
        }
    }
}

// ============================================================================
// Issues and recommendations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Inactivity,
    LowEngagement,
    PerformanceLow,
    AvMismatch,
    ChaoticInteraction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ModeChange,
    IntroduceNovelty,
    OptimizePerformance,
    HarmonizeAv,
    IncreaseInteractivity,
    SubtleEvolution,
    EncourageExploration,
    DeepenExperience,
    MaintainInterest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub priority: Severity,
    /// Target mode for `ModeChange`
    #[serde(default)]
    pub target: Option<String>,
    pub reason: String,
}

// ============================================================================
// Aggregate
// ============================================================================

/// Context copied from the snapshot so decisions can be made (and later
/// inspected) without holding the snapshot itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub current_mode: String,
    pub fractal_type: String,
    pub visual: VisualParameters,
    pub audio: AudioParameters,
    pub session_duration_ms: u64,
    pub time_since_last_interaction_ms: u64,
    pub interaction_count: usize,
    pub idle_threshold_ms: u64,
}

/// Everything one analysis pass produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAnalysis {
    pub timestamp_ms: u64,
    pub context: AnalysisContext,
    pub engagement: EngagementAnalysis,
    pub pattern: InteractionPatternResult,
    pub audio_visual: AudioVisualRelationship,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<Recommendation>,
}

impl StateAnalysis {
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn recommendation(&self, kind: RecommendationKind) -> Option<&Recommendation> {
        self.recommendations.iter().find(|r| r.kind == kind)
    }

    /// Idle longer than the configured threshold
    pub fn is_idle(&self) -> bool {
        self.context.time_since_last_interaction_ms > self.context.idle_threshold_ms
    }
}
