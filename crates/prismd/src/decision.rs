//! Decision engine: AI path, then rule path, then a fixed safe fallback.
//!
//! The AI path renders the analysis into a prompt, submits it through the
//! request queue and maps the reply's attention state onto a mode. Any
//! failure there downgrades to the rule path, which is a pure function of
//! the analysis plus a seeded RNG.

use prism_shared::mode::{CONTEMPLATIVE, ENERGETIC, EXPLORATORY, QUANTUM};
use prism_shared::{
    Attention, AudioChange, AudioPatch, ChatMessage, ChatRequest, Decision, FractalChange,
    InteractionPattern, PrismError, Provenance, StateAnalysis, Trend, UiDirectives, VisualPatch,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::lock;
use crate::config::ReasoningConfig;
use crate::queue::RequestQueue;
use crate::transport::CHAT_ENDPOINT;

/// Decisions kept for inspection
pub const MAX_DECISION_HISTORY: usize = 20;

/// Fractal types the rule path switches between
pub const FRACTAL_TYPES: &[&str] = &["mandelbrot", "julia", "burning_ship", "quaternion"];

/// Attention state → mode. Exact match wins, else first partial match.
const MOOD_MODES: &[(&str, &str)] = &[
    ("bored", ENERGETIC),
    ("disengaged", ENERGETIC),
    ("restless", ENERGETIC),
    ("overwhelmed", CONTEMPLATIVE),
    ("stressed", CONTEMPLATIVE),
    ("curious", EXPLORATORY),
    ("immersed", QUANTUM),
    ("playful", QUANTUM),
];

const IDLE_PROMPTS: &[&str] = &[
    "Drag across the fractal to steer it",
    "Scroll to dive deeper",
    "Try a different preset",
];

const GUIDANCE_PROMPTS: &[&str] = &[
    "Hold still on a detail and let it unfold",
    "Rotate slowly to find hidden symmetry",
    "Zoom into the edges, that is where detail lives",
];

const SYSTEM_PROMPT: &str = "You steer a generative fractal and music piece for one viewer. \
Read the telemetry and reply with a single JSON object with keys: \
attention_state (one word describing the viewer), fractal (optional: type, zoom, rotation, \
iterations, color_shift), audio (optional: tempo, volume, base_frequency, binaural_beat, \
rhythm_enabled, harmonic_ratio, reverb), prompt (optional short hint for the viewer), \
highlight (optional UI element id), rationale. JSON only.";

// ============================================================================
// Options and records
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Try the AI path before the rules
    pub ai_enabled: bool,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Consecutive AI failures before the AI path is skipped
    pub failure_threshold: u32,
    /// Decisions to skip the AI path for once tripped
    pub cooldown_cycles: u32,
    pub seed: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&ReasoningConfig::default(), None)
    }
}

impl EngineOptions {
    pub fn from_config(config: &ReasoningConfig, seed: Option<u64>) -> Self {
        Self {
            ai_enabled: config.enabled,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            failure_threshold: config.failure_threshold,
            cooldown_cycles: config.cooldown_cycles,
            seed,
        }
    }
}

/// One entry of the decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp_ms: u64,
    pub analysis: StateAnalysis,
    pub decision: Decision,
}

/// Result of interpreting a free-text request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInterpretation {
    pub understood: bool,
    pub target_mode: Option<String>,
    pub fractal_type: Option<String>,
    pub message: String,
}

/// Reply shape expected from the reasoning service
#[derive(Debug, Deserialize)]
struct AiSuggestion {
    attention_state: String,
    #[serde(default)]
    fractal: Option<AiFractal>,
    #[serde(default)]
    audio: Option<AudioPatch>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    highlight: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AiFractal {
    #[serde(rename = "type", default)]
    fractal_type: Option<String>,
    #[serde(flatten)]
    parameters: VisualPatch,
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Skips the AI path for a while after repeated failures
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    cooldown: u32,
    consecutive_failures: u32,
    skip_remaining: u32,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: u32) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            skip_remaining: 0,
        }
    }

    /// Consumes one cooldown slot when open
    fn allow(&mut self) -> bool {
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            return false;
        }
        true
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.threshold > 0 && self.consecutive_failures >= self.threshold {
            warn!(
                "AI path failed {} times in a row, skipping it for {} decisions",
                self.consecutive_failures, self.cooldown
            );
            self.skip_remaining = self.cooldown;
            self.consecutive_failures = 0;
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct DecisionEngine {
    queue: Option<Arc<RequestQueue>>,
    options: EngineOptions,
    rng: Mutex<StdRng>,
    breaker: Mutex<CircuitBreaker>,
    history: Mutex<VecDeque<DecisionRecord>>,
}

impl DecisionEngine {
    /// `queue` is None when no reasoning service is wired in
    pub fn new(queue: Option<Arc<RequestQueue>>, options: EngineOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let breaker = CircuitBreaker::new(options.failure_threshold, options.cooldown_cycles);
        Self {
            queue,
            options,
            rng: Mutex::new(rng),
            breaker: Mutex::new(breaker),
            history: Mutex::new(VecDeque::with_capacity(MAX_DECISION_HISTORY)),
        }
    }

    /// Produce one decision. Never fails.
    pub async fn decide(&self, analysis: &StateAnalysis) -> Decision {
        let decision = match self.try_ai(analysis).await {
            Some(decision) => decision,
            None => self.rule_or_fallback(analysis),
        };

        info!(
            "Decision {} ({}): {}",
            decision.id, decision.provenance, decision.rationale
        );

        let mut history = lock(&self.history);
        if history.len() >= MAX_DECISION_HISTORY {
            history.pop_front();
        }
        history.push_back(DecisionRecord {
            timestamp_ms: analysis.timestamp_ms,
            analysis: analysis.clone(),
            decision: decision.clone(),
        });

        decision
    }

    /// Oldest first
    pub fn history(&self) -> Vec<DecisionRecord> {
        lock(&self.history).iter().cloned().collect()
    }

    async fn try_ai(&self, analysis: &StateAnalysis) -> Option<Decision> {
        if !self.options.ai_enabled {
            return None;
        }
        let queue = self.queue.as_ref()?;
        if !lock(&self.breaker).allow() {
            debug!("AI path cooling down");
            return None;
        }

        match self.ai_decision(queue, analysis).await {
            Ok(decision) => {
                lock(&self.breaker).record_success();
                Some(decision)
            }
            Err(e) => {
                lock(&self.breaker).record_failure();
                warn!("AI decision failed, using rules: {}", e);
                None
            }
        }
    }

    async fn ai_decision(
        &self,
        queue: &RequestQueue,
        analysis: &StateAnalysis,
    ) -> Result<Decision, PrismError> {
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(render_prompt(analysis)),
            ],
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        let response = queue
            .enqueue(CHAT_ENDPOINT, request, &cache_key(analysis))
            .await?;
        let payload = response.content_json()?;
        let suggestion: AiSuggestion = serde_json::from_value(payload)
            .map_err(|e| PrismError::Parse(format!("Unexpected reply shape: {}", e)))?;

        let decision = decision_from_suggestion(suggestion, analysis);
        if !is_usable(&decision) {
            return Err(PrismError::Parse("Reply contains non-finite values".to_string()));
        }
        Ok(decision)
    }

    fn rule_or_fallback(&self, analysis: &StateAnalysis) -> Decision {
        let decision = {
            let mut rng = lock(&self.rng);
            rule_decision(analysis, &mut rng)
        };
        match decision {
            Some(d) if is_usable(&d) => d,
            _ => {
                warn!("Rule path produced nothing usable, using fallback");
                fallback_decision()
            }
        }
    }

    /// Keyword interpretation of a free-text request
    pub fn interpret_prompt(&self, text: &str) -> PromptInterpretation {
        interpret_prompt(text)
    }
}

// ============================================================================
// AI path helpers
// ============================================================================

fn trend_label(trend: Trend) -> &'static str {
    match trend {
        Trend::Increasing => "increasing",
        Trend::Decreasing => "decreasing",
        Trend::Stable => "stable",
    }
}

fn attention_label(attention: Attention) -> &'static str {
    match attention {
        Attention::Focused => "focused",
        Attention::Distracted => "distracted",
        Attention::Passive => "passive",
    }
}

/// Fixed prompt template filled from the analysis
pub fn render_prompt(analysis: &StateAnalysis) -> String {
    let ctx = &analysis.context;
    let issues = if analysis.issues.is_empty() {
        "none".to_string()
    } else {
        analysis
            .issues
            .iter()
            .map(|i| {
                let kind = serde_json::to_value(i.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("{} ({:?})", kind, i.severity).to_lowercase()
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "Current fractal: {} in {} mode\n\
         Parameters: zoom {:.2}, rotation {:.2}, iterations {}, color shift {:.2}; \
         tempo {:.0} bpm, volume {:.2}, base {:.0} Hz, rhythm {}\n\
         Session length: {}s\n\
         Seconds since last input: {}\n\
         Interactions in window: {}\n\
         Engagement level: {:.2} ({})\n\
         Attention: {}\n\
         Pattern: {}\n\
         Detected issues: {}",
        ctx.fractal_type,
        ctx.current_mode,
        ctx.visual.zoom,
        ctx.visual.rotation,
        ctx.visual.iterations,
        ctx.visual.color_shift,
        ctx.audio.tempo,
        ctx.audio.volume,
        ctx.audio.base_frequency,
        if ctx.audio.rhythm_enabled { "on" } else { "off" },
        ctx.session_duration_ms / 1000,
        ctx.time_since_last_interaction_ms / 1000,
        ctx.interaction_count,
        analysis.engagement.level,
        trend_label(analysis.engagement.trend),
        attention_label(analysis.engagement.attention),
        analysis.pattern.pattern,
        issues,
    )
}

/// Coarse key so near-identical states share a cached reply
pub fn cache_key(analysis: &StateAnalysis) -> String {
    let mut issues: Vec<String> = analysis
        .issues
        .iter()
        .map(|i| format!("{:?}", i.kind))
        .collect();
    issues.sort();
    format!(
        "decision:{}:{}:{}:{}:{:.1}:{}",
        analysis.context.current_mode,
        analysis.context.fractal_type,
        attention_label(analysis.engagement.attention),
        analysis.pattern.pattern,
        analysis.engagement.level,
        issues.join("+"),
    )
}

/// Map an attention state onto a mode name
pub fn mood_to_mode(state: &str) -> Option<&'static str> {
    let state = state.trim().to_lowercase();
    if state.is_empty() {
        return None;
    }
    MOOD_MODES
        .iter()
        .find(|(mood, _)| *mood == state)
        .or_else(|| {
            MOOD_MODES
                .iter()
                .find(|(mood, _)| state.contains(mood) || mood.contains(state.as_str()))
        })
        .map(|(_, mode)| *mode)
}

fn decision_from_suggestion(suggestion: AiSuggestion, analysis: &StateAnalysis) -> Decision {
    let rationale = suggestion
        .rationale
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| format!("Viewer appears {}", suggestion.attention_state));
    let mut decision = Decision::new(Provenance::Ai, rationale);

    if let Some(mode) = mood_to_mode(&suggestion.attention_state) {
        if mode != analysis.context.current_mode {
            decision = decision.with_mode(mode);
        }
    }

    if let Some(fractal) = suggestion.fractal {
        let fractal_type = fractal
            .fractal_type
            .filter(|t| *t != analysis.context.fractal_type);
        if fractal_type.is_some() || !fractal.parameters.is_empty() {
            decision = decision.with_fractal(FractalChange {
                fractal_type,
                parameters: fractal.parameters,
                duration_secs: 3.0,
            });
        }
    }

    if let Some(audio) = suggestion.audio.filter(|a| !a.is_empty()) {
        decision = decision.with_audio(AudioChange {
            parameters: audio,
            duration_secs: 4.0,
        });
    }

    decision.with_ui(UiDirectives {
        prompt: suggestion.prompt,
        highlight: suggestion.highlight,
    })
}

fn finite(value: Option<f64>) -> bool {
    value.map(f64::is_finite).unwrap_or(true)
}

/// All numbers finite and durations non-negative
fn is_usable(decision: &Decision) -> bool {
    let fractal_ok = decision.fractal.as_ref().map_or(true, |f| {
        let p = &f.parameters;
        f.duration_secs.is_finite()
            && f.duration_secs >= 0.0
            && [p.zoom, p.rotation, p.color_shift, p.center_x, p.center_y, p.dimension]
                .into_iter()
                .all(finite)
    });
    let audio_ok = decision.audio.as_ref().map_or(true, |a| {
        let p = &a.parameters;
        a.duration_secs.is_finite()
            && a.duration_secs >= 0.0
            && [p.tempo, p.volume, p.base_frequency, p.binaural_beat, p.harmonic_ratio, p.reverb]
                .into_iter()
                .all(finite)
    });
    fractal_ok && audio_ok
}

// ============================================================================
// Rule path
// ============================================================================

/// One row of the rule table; the first row whose predicate holds builds the decision
struct Rule {
    name: &'static str,
    applies: fn(&StateAnalysis) -> bool,
    build: fn(&StateAnalysis, &mut StdRng) -> Decision,
}

const RULES: &[Rule] = &[
    Rule {
        name: "idle_novelty",
        applies: is_idle,
        build: idle_novelty,
    },
    Rule {
        name: "deep_exploration",
        applies: is_deep_exploration,
        build: immersive_drift,
    },
    Rule {
        name: "shallow_exploration",
        applies: is_engaged,
        build: guidance,
    },
];

/// Mode suggestion row: predicate, target mode, probability
struct ModeRule {
    applies: fn(&StateAnalysis) -> bool,
    mode: &'static str,
    probability: f64,
}

const MODE_RULES: &[ModeRule] = &[
    ModeRule {
        applies: is_low_engagement,
        mode: ENERGETIC,
        probability: 1.0,
    },
    ModeRule {
        applies: is_high_explorative,
        mode: EXPLORATORY,
        probability: 1.0,
    },
    ModeRule {
        applies: is_high_engagement,
        mode: CONTEMPLATIVE,
        probability: 1.0,
    },
    ModeRule {
        applies: is_erratic,
        mode: CONTEMPLATIVE,
        probability: 1.0,
    },
    ModeRule {
        applies: is_repetitive,
        mode: QUANTUM,
        probability: 0.3,
    },
];

fn is_low_engagement(analysis: &StateAnalysis) -> bool {
    analysis.engagement.level < 0.3
}

fn is_high_engagement(analysis: &StateAnalysis) -> bool {
    analysis.engagement.level > 0.8
}

fn is_high_explorative(analysis: &StateAnalysis) -> bool {
    is_high_engagement(analysis) && analysis.pattern.pattern == InteractionPattern::Explorative
}

fn is_erratic(analysis: &StateAnalysis) -> bool {
    analysis.pattern.pattern.is_erratic()
}

fn is_repetitive(analysis: &StateAnalysis) -> bool {
    analysis.pattern.pattern.is_repetitive()
}

fn is_idle(analysis: &StateAnalysis) -> bool {
    analysis.is_idle()
}

fn is_engaged(analysis: &StateAnalysis) -> bool {
    !analysis.is_idle()
}

fn is_deep_exploration(analysis: &StateAnalysis) -> bool {
    is_engaged(analysis)
        && analysis.engagement.attention == Attention::Focused
        && analysis.engagement.level >= 0.6
}

/// Rule decision plus the independent mode suggestion
pub fn rule_decision(analysis: &StateAnalysis, rng: &mut StdRng) -> Option<Decision> {
    let rule = RULES.iter().find(|r| (r.applies)(analysis))?;
    debug!("Rule matched: {}", rule.name);
    let mut decision = (rule.build)(analysis, rng);

    if let Some(mode) = suggest_mode(analysis, rng) {
        if mode != analysis.context.current_mode {
            decision = decision.with_mode(mode);
        }
    }
    Some(decision)
}

/// First matching mode rule decides; a failed draw means no change
pub fn suggest_mode(analysis: &StateAnalysis, rng: &mut StdRng) -> Option<&'static str> {
    let rule = MODE_RULES.iter().find(|r| (r.applies)(analysis))?;
    if rule.probability >= 1.0 || rng.gen_bool(rule.probability) {
        Some(rule.mode)
    } else {
        None
    }
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> Option<&'a str> {
    items.choose(rng).copied()
}

fn idle_novelty(analysis: &StateAnalysis, rng: &mut StdRng) -> Decision {
    let ctx = &analysis.context;
    let mut decision = Decision::new(
        Provenance::Rule,
        format!(
            "No input for {}s, introducing novelty",
            ctx.time_since_last_interaction_ms / 1000
        ),
    );

    if rng.gen_bool(0.5) {
        let change = if rng.gen_bool(0.3) {
            let others: Vec<&str> = FRACTAL_TYPES
                .iter()
                .copied()
                .filter(|t| *t != ctx.fractal_type)
                .collect();
            FractalChange {
                fractal_type: pick(rng, &others).map(str::to_string),
                parameters: VisualPatch::default(),
                duration_secs: 3.0,
            }
        } else {
            FractalChange {
                fractal_type: None,
                parameters: VisualPatch {
                    zoom: Some(ctx.visual.zoom * rng.gen_range(0.6..1.6)),
                    color_shift: Some(rng.gen_range(0.0..1.0)),
                    ..Default::default()
                },
                duration_secs: 3.0,
            }
        };
        decision = decision.with_fractal(change);
    } else {
        let parameters = if !ctx.audio.rhythm_enabled {
            AudioPatch {
                rhythm_enabled: Some(true),
                tempo: Some(ctx.audio.tempo.max(100.0)),
                ..Default::default()
            }
        } else {
            let ratio = [0.75, 1.25, 1.5][rng.gen_range(0..3)];
            AudioPatch {
                base_frequency: Some(ctx.audio.base_frequency * ratio),
                binaural_beat: Some(rng.gen_range(4.0..12.0)),
                ..Default::default()
            }
        };
        decision = decision.with_audio(AudioChange {
            parameters,
            duration_secs: 4.0,
        });
    }

    decision.with_ui(UiDirectives {
        prompt: pick(rng, IDLE_PROMPTS).map(str::to_string),
        highlight: None,
    })
}

fn immersive_drift(analysis: &StateAnalysis, rng: &mut StdRng) -> Decision {
    let decision = Decision::new(Provenance::Rule, "Deep exploration, subtle immersive drift");
    if rng.gen_bool(0.3) {
        let ratio = (analysis.context.audio.harmonic_ratio + rng.gen_range(-0.1..0.1)).clamp(1.0, 3.0);
        decision.with_audio(AudioChange {
            parameters: AudioPatch {
                harmonic_ratio: Some(ratio),
                ..Default::default()
            },
            duration_secs: 8.0,
        })
    } else {
        decision
    }
}

fn guidance(analysis: &StateAnalysis, rng: &mut StdRng) -> Decision {
    let highlight = match analysis.pattern.pattern {
        InteractionPattern::Scanning | InteractionPattern::Minimal => "preset-selector",
        _ => "fractal-canvas",
    };
    Decision::new(Provenance::Rule, "Shallow exploration, offering guidance").with_ui(UiDirectives {
        prompt: pick(rng, GUIDANCE_PROMPTS).map(str::to_string),
        highlight: Some(highlight.to_string()),
    })
}

/// Hard-coded safe decision: no mode switch, calming audio
pub fn fallback_decision() -> Decision {
    Decision::new(Provenance::Fallback, "fallback").with_audio(AudioChange {
        parameters: AudioPatch {
            tempo: Some(60.0),
            volume: Some(0.4),
            reverb: Some(0.6),
            ..Default::default()
        },
        duration_secs: 5.0,
    })
}

// ============================================================================
// Prompt interpretation
// ============================================================================

const PROMPT_MODES: &[(&[&str], &str)] = &[
    (&["calm", "relax", "slow", "quiet", "peace"], CONTEMPLATIVE),
    (&["faster", "energ", "excit", "upbeat", "intense"], ENERGETIC),
    (&["explore", "discover", "wander", "journey"], EXPLORATORY),
    (&["chaos", "quantum", "surprise", "weird", "random"], QUANTUM),
];

const PROMPT_FRACTALS: &[(&[&str], &str)] = &[
    (&["julia"], "julia"),
    (&["mandelbrot"], "mandelbrot"),
    (&["burning ship", "burning_ship", "ship"], "burning_ship"),
    (&["quaternion", "4d", "hypercomplex"], "quaternion"),
];

/// Keyword interpretation of a free-text request
pub fn interpret_prompt(text: &str) -> PromptInterpretation {
    let lower = text.to_lowercase();
    let find = |table: &[(&[&str], &'static str)]| {
        table
            .iter()
            .find(|(keys, _)| keys.iter().any(|k| lower.contains(k)))
            .map(|(_, target)| target.to_string())
    };

    let target_mode = find(PROMPT_MODES);
    let fractal_type = find(PROMPT_FRACTALS);

    let message = match (&target_mode, &fractal_type) {
        (Some(m), Some(f)) => format!("Switching to {} mode with the {} fractal", m, f),
        (Some(m), None) => format!("Switching to {} mode", m),
        (None, Some(f)) => format!("Showing the {} fractal", f),
        (None, None) => "Sorry, I could not understand that request".to_string(),
    };

    PromptInterpretation {
        understood: target_mode.is_some() || fractal_type.is_some(),
        target_mode,
        fractal_type,
        message,
    }
}
