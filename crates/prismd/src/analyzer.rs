//! State analyzer: turns a telemetry snapshot into engagement, interaction
//! pattern, audio/visual coherence, issues and recommendations.
//!
//! Pure computation, no I/O. Bad input degrades to low-confidence output
//! (`insufficient_data`, no issues) instead of failing.

use prism_shared::mode::{CONTEMPLATIVE, ENERGETIC};
use prism_shared::{
    AnalysisContext, Attention, AudioParameters, AudioVisualRelationship, Coherence,
    EngagementAnalysis, EngagementFactors, InteractionEvent, InteractionKind, InteractionPattern,
    InteractionPatternResult, IntervalStats, Issue, IssueKind, Recommendation,
    RecommendationKind, RenderState, Severity, StateAnalysis, TelemetrySnapshot, Trend,
    VisualParameters,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::cache::lock;
use crate::config::AdaptationConfig;

/// Level change needed before the trend moves off "stable"
const TREND_DELTA: f64 = 0.1;

/// Window used for the focused-run test
const FOCUS_WINDOW_MS: u64 = 10_000;

/// Share of events that must fall inside one focus window
const FOCUS_SHARE: f64 = 0.7;

/// Distinct interaction types that count as full complexity
const COMPLEXITY_TYPES: f64 = 5.0;

/// Minimum sample before a chaotic pattern is reported as an issue
const CHAOTIC_MIN_SAMPLE: usize = 10;

/// Span of the interaction rate window
const RATE_WINDOW_MS: u64 = 60_000;

/// Timestamps held for the rate window
const RATE_WINDOW_MAX: usize = 1_000;

const FPS_MEDIUM: f64 = 30.0;
const FPS_HIGH: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub idle_threshold_ms: u64,
    /// Interactions per minute considered fully engaged
    pub threshold_frequency: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 60_000,
            threshold_frequency: 10.0,
        }
    }
}

impl From<&AdaptationConfig> for AnalyzerConfig {
    fn from(config: &AdaptationConfig) -> Self {
        Self {
            idle_threshold_ms: config.idle_threshold_ms,
            threshold_frequency: config.threshold_frequency,
        }
    }
}

/// Live view merged from interaction and render reports between cycles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub last_interaction_ms: Option<u64>,
    /// Interaction times within a minute of the newest, oldest first
    pub recent_timestamps: VecDeque<u64>,
    pub render: RenderState,
    /// Engagement level of the previous analysis, for the trend
    pub previous_level: Option<f64>,
}

pub struct StateAnalyzer {
    config: AnalyzerConfig,
    state: Mutex<CurrentState>,
}

impl StateAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: AnalyzerConfig {
                idle_threshold_ms: config.idle_threshold_ms.max(1),
                threshold_frequency: if config.threshold_frequency > 0.0 {
                    config.threshold_frequency
                } else {
                    AnalyzerConfig::default().threshold_frequency
                },
            },
            state: Mutex::new(CurrentState::default()),
        }
    }

    pub fn config(&self) -> AnalyzerConfig {
        self.config
    }

    /// Merge an interaction into the live view
    pub fn record_interaction(&self, event: &InteractionEvent) {
        let mut state = lock(&self.state);
        let t = event.timestamp_ms;
        let newest = state.last_interaction_ms.map_or(t, |last| last.max(t));
        state.last_interaction_ms = Some(newest);

        let at = state.recent_timestamps.partition_point(|&held| held <= t);
        state.recent_timestamps.insert(at, t);

        let cutoff = newest.saturating_sub(RATE_WINDOW_MS);
        while state
            .recent_timestamps
            .front()
            .is_some_and(|&oldest| oldest < cutoff)
            || state.recent_timestamps.len() > RATE_WINDOW_MAX
        {
            state.recent_timestamps.pop_front();
        }
    }

    /// Merge renderer figures into the live view
    pub fn record_render_state(&self, partial: &RenderState) {
        lock(&self.state).render.merge(partial);
    }

    /// Copy of the live view
    pub fn current_state(&self) -> CurrentState {
        lock(&self.state).clone()
    }

    /// Run one analysis pass over a snapshot
    pub fn analyze(&self, snapshot: &TelemetrySnapshot) -> StateAnalysis {
        let now = snapshot.timestamp_ms;
        let (held_last, held_per_minute, held_render, previous_level) = {
            let state = lock(&self.state);
            let cutoff = now.saturating_sub(RATE_WINDOW_MS);
            let in_window = state
                .recent_timestamps
                .iter()
                .filter(|&&t| t >= cutoff && t <= now)
                .count();
            (
                state.last_interaction_ms,
                in_window as f64,
                state.render.clone(),
                state.previous_level,
            )
        };

        // The live view may have seen an interaction newer than the snapshot
        let mut idle_ms = snapshot.time_since_last_interaction_ms;
        if let Some(last) = held_last {
            if last <= snapshot.timestamp_ms {
                idle_ms = idle_ms.min(snapshot.timestamp_ms - last);
            }
        }

        let mut events: Vec<&InteractionEvent> = snapshot.recent_interactions.iter().collect();
        events.sort_by_key(|e| e.timestamp_ms);

        // The snapshot only carries the latest events; the held window sees
        // every interaction of the last minute
        let per_minute = interactions_per_minute(now, &events).max(held_per_minute);
        let engagement = self.engagement(idle_ms, per_minute, &events, previous_level);
        let pattern = classify_pattern(&events);
        let audio_visual = audio_visual_relationship(&snapshot.audio.parameters, &snapshot.visual.parameters);

        let mut render = held_render;
        render.merge(&snapshot.render);

        let issues = self.detect_issues(idle_ms, &engagement, &pattern, &audio_visual, &render);
        let recommendations = recommend(&issues, &engagement, &pattern, idle_ms > self.config.idle_threshold_ms);

        lock(&self.state).previous_level = Some(engagement.level);

        debug!(
            "Analysis: level={:.2} trend={:?} attention={:?} pattern={} issues={}",
            engagement.level,
            engagement.trend,
            engagement.attention,
            pattern.pattern,
            issues.len()
        );

        StateAnalysis {
            timestamp_ms: snapshot.timestamp_ms,
            context: AnalysisContext {
                current_mode: snapshot.current_mode.clone(),
                fractal_type: snapshot.visual.fractal_type.clone(),
                visual: snapshot.visual.parameters.clone(),
                audio: snapshot.audio.parameters.clone(),
                session_duration_ms: snapshot.session_duration_ms,
                time_since_last_interaction_ms: idle_ms,
                interaction_count: snapshot.recent_interactions.len(),
                idle_threshold_ms: self.config.idle_threshold_ms,
            },
            engagement,
            pattern,
            audio_visual,
            issues,
            recommendations,
        }
    }

    fn engagement(
        &self,
        idle_ms: u64,
        per_minute: f64,
        events: &[&InteractionEvent],
        previous_level: Option<f64>,
    ) -> EngagementAnalysis {
        let threshold = self.config.idle_threshold_ms as f64;
        let recency = (1.0 - idle_ms as f64 / threshold).max(0.0);

        let frequency = (per_minute / self.config.threshold_frequency).min(1.0);

        let distinct: HashSet<&InteractionKind> = events.iter().map(|e| &e.kind).collect();
        let complexity = (distinct.len() as f64 / COMPLEXITY_TYPES).min(1.0);

        let level = finite_or_zero(0.5 * recency + 0.3 * frequency + 0.2 * complexity).clamp(0.0, 1.0);

        let trend = match previous_level {
            Some(prev) if level - prev > TREND_DELTA => Trend::Increasing,
            Some(prev) if prev - level > TREND_DELTA => Trend::Decreasing,
            _ => Trend::Stable,
        };

        let attention = if idle_ms > self.config.idle_threshold_ms {
            Attention::Passive
        } else if per_minute > 2.0 * self.config.threshold_frequency {
            Attention::Distracted
        } else {
            Attention::Focused
        };

        EngagementAnalysis {
            level,
            trend,
            attention,
            factors: EngagementFactors {
                recency: finite_or_zero(recency),
                frequency: finite_or_zero(frequency),
                complexity,
            },
        }
    }

    fn detect_issues(
        &self,
        idle_ms: u64,
        engagement: &EngagementAnalysis,
        pattern: &InteractionPatternResult,
        audio_visual: &AudioVisualRelationship,
        render: &RenderState,
    ) -> Vec<Issue> {
        let mut issues = Vec::new();
        let threshold = self.config.idle_threshold_ms;

        if idle_ms > threshold {
            let severity = if idle_ms > 2 * threshold {
                Severity::High
            } else {
                Severity::Medium
            };
            issues.push(Issue {
                kind: IssueKind::Inactivity,
                severity,
                message: format!("No interaction for {}s", idle_ms / 1000),
                value: idle_ms as f64 / 1000.0,
            });
        }

        if engagement.level < 0.3 && engagement.trend == Trend::Decreasing {
            issues.push(Issue {
                kind: IssueKind::LowEngagement,
                severity: Severity::Medium,
                message: format!("Engagement low and falling ({:.2})", engagement.level),
                value: engagement.level,
            });
        }

        if let Some(fps) = render.fps.filter(|f| f.is_finite()) {
            let severity = if fps < FPS_HIGH {
                Some(Severity::High)
            } else if fps < FPS_MEDIUM {
                Some(Severity::Medium)
            } else {
                None
            };
            if let Some(severity) = severity {
                issues.push(Issue {
                    kind: IssueKind::PerformanceLow,
                    severity,
                    message: format!("Rendering at {:.0} fps", fps),
                    value: fps,
                });
            }
        }

        if !audio_visual.complementary || audio_visual.coherence == Coherence::Low {
            issues.push(Issue {
                kind: IssueKind::AvMismatch,
                severity: if audio_visual.complementary {
                    Severity::Low
                } else {
                    Severity::Medium
                },
                message: format!(
                    "Audio intensity {:.2} vs visual intensity {:.2}",
                    audio_visual.audio_intensity, audio_visual.visual_intensity
                ),
                value: (audio_visual.audio_intensity - audio_visual.visual_intensity).abs(),
            });
        }

        if pattern.pattern == InteractionPattern::Chaotic && pattern.sample_size >= CHAOTIC_MIN_SAMPLE {
            issues.push(Issue {
                kind: IssueKind::ChaoticInteraction,
                severity: Severity::Medium,
                message: format!("Erratic input across {} events", pattern.sample_size),
                value: pattern.stats.map(|s| s.cv).unwrap_or(0.0),
            });
        }

        issues
    }
}

// ============================================================================
// Interaction pattern
// ============================================================================

/// Classify the inter-event rhythm of a window of events (sorted by time)
pub fn classify_pattern(events: &[&InteractionEvent]) -> InteractionPatternResult {
    let n = events.len();
    if n < 2 {
        return InteractionPatternResult::insufficient(n);
    }

    let intervals: Vec<f64> = events
        .windows(2)
        .map(|w| w[1].timestamp_ms.saturating_sub(w[0].timestamp_ms) as f64)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let std_dev = variance.sqrt();
    let cv = if mean > 0.0 { std_dev / mean } else { 0.0 };

    let distinct = events.iter().map(|e| &e.kind).collect::<HashSet<_>>().len();

    let rhythmic = cv < 0.3;
    let chaotic = cv > 0.8 && distinct > 3;
    let explorative = distinct > 2 && cv <= 0.8;
    let focused = longest_run_within(events, FOCUS_WINDOW_MS) as f64 / n as f64 > FOCUS_SHARE;

    let pattern = if rhythmic && focused {
        InteractionPattern::Deliberate
    } else if rhythmic {
        InteractionPattern::Scanning
    } else if explorative {
        InteractionPattern::Explorative
    } else if focused {
        InteractionPattern::Focused
    } else if chaotic {
        InteractionPattern::Chaotic
    } else if n < 5 {
        InteractionPattern::Minimal
    } else {
        InteractionPattern::Mixed
    };

    InteractionPatternResult {
        pattern,
        stats: Some(IntervalStats {
            mean_ms: mean,
            std_dev_ms: std_dev,
            cv,
        }),
        sample_size: n,
        distinct_types: distinct,
    }
}

/// Most events that fit inside any window of `window_ms`
fn longest_run_within(events: &[&InteractionEvent], window_ms: u64) -> usize {
    let mut best = 0;
    let mut start = 0;
    for end in 0..events.len() {
        while events[end].timestamp_ms - events[start].timestamp_ms > window_ms {
            start += 1;
        }
        best = best.max(end - start + 1);
    }
    best
}

fn interactions_per_minute(now_ms: u64, events: &[&InteractionEvent]) -> f64 {
    let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
    events
        .iter()
        .filter(|e| e.timestamp_ms >= cutoff && e.timestamp_ms <= now_ms)
        .count() as f64
}

// ============================================================================
// Audio / visual coherence
// ============================================================================

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    finite_or_zero((value - min) / (max - min)).clamp(0.0, 1.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Weighted tempo, volume and base frequency
pub fn audio_intensity(audio: &AudioParameters) -> f64 {
    0.4 * normalize(audio.tempo, 40.0, 180.0)
        + 0.4 * normalize(audio.volume, 0.0, 1.0)
        + 0.2 * normalize(audio.base_frequency, 55.0, 880.0)
}

/// Weighted iteration count, inverse zoom and rotation magnitude
pub fn visual_intensity(visual: &VisualParameters) -> f64 {
    let inverse_zoom = if visual.zoom > 0.0 {
        (1.0 / visual.zoom).min(1.0)
    } else {
        0.0
    };
    0.4 * normalize(visual.iterations as f64, 50.0, 500.0)
        + 0.3 * finite_or_zero(inverse_zoom)
        + 0.3 * normalize(visual.rotation.abs(), 0.0, std::f64::consts::PI)
}

pub fn audio_visual_relationship(
    audio: &AudioParameters,
    visual: &VisualParameters,
) -> AudioVisualRelationship {
    let a = audio_intensity(audio);
    let v = visual_intensity(visual);
    let diff = (a - v).abs();

    let coherence = if diff < 0.2 {
        Coherence::High
    } else if diff < 0.4 {
        Coherence::Medium
    } else {
        Coherence::Low
    };
    let clash = (a > 0.7 && v < 0.3) || (v > 0.7 && a < 0.3);

    AudioVisualRelationship {
        audio_intensity: a,
        visual_intensity: v,
        coherence,
        complementary: !clash,
    }
}

// ============================================================================
// Recommendations
// ============================================================================

fn recommend(
    issues: &[Issue],
    engagement: &EngagementAnalysis,
    pattern: &InteractionPatternResult,
    idle: bool,
) -> Vec<Recommendation> {
    let mut out: Vec<Recommendation> = issues.iter().map(recommendation_for).collect();

    match pattern.pattern {
        InteractionPattern::Minimal if !idle => out.push(Recommendation {
            kind: RecommendationKind::IncreaseInteractivity,
            priority: Severity::Low,
            target: None,
            reason: "Only a few interactions so far".to_string(),
        }),
        InteractionPattern::Scanning => out.push(Recommendation {
            kind: RecommendationKind::EncourageExploration,
            priority: Severity::Low,
            target: None,
            reason: "Regular but shallow interaction".to_string(),
        }),
        InteractionPattern::Deliberate | InteractionPattern::Focused if engagement.level > 0.7 => {
            out.push(Recommendation {
                kind: RecommendationKind::DeepenExperience,
                priority: Severity::Medium,
                target: None,
                reason: "User is absorbed".to_string(),
            })
        }
        _ => {}
    }

    if issues.is_empty() {
        out.push(Recommendation {
            kind: RecommendationKind::MaintainInterest,
            priority: Severity::Low,
            target: None,
            reason: "No issues detected".to_string(),
        });
    }

    // Stable: equal priorities keep rule order
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

fn recommendation_for(issue: &Issue) -> Recommendation {
    let (kind, target) = match issue.kind {
        IssueKind::Inactivity => (RecommendationKind::ModeChange, Some(ENERGETIC)),
        IssueKind::LowEngagement => (RecommendationKind::IntroduceNovelty, None),
        IssueKind::PerformanceLow => (RecommendationKind::OptimizePerformance, None),
        IssueKind::AvMismatch => (RecommendationKind::HarmonizeAv, None),
        IssueKind::ChaoticInteraction => (RecommendationKind::SubtleEvolution, Some(CONTEMPLATIVE)),
    };
    Recommendation {
        kind,
        priority: issue.severity,
        target: target.map(str::to_string),
        reason: issue.message.clone(),
    }
}
