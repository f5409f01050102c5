//! Decisions: proposed change sets applied once by the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::telemetry::{AudioPatch, VisualPatch};

/// Which path produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Ai,
    Rule,
    Fallback,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provenance::Ai => "ai",
            Provenance::Rule => "rule",
            Provenance::Fallback => "fallback",
        };
        write!(f, "{}", s)
    }
}

/// Fractal type switch and/or parameter transition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FractalChange {
    #[serde(default)]
    pub fractal_type: Option<String>,
    #[serde(default)]
    pub parameters: VisualPatch,
    /// Transition length in seconds
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioChange {
    pub parameters: AudioPatch,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiDirectives {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub highlight: Option<String>,
}

impl UiDirectives {
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none() && self.highlight.is_none()
    }
}

/// A proposed change set. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    #[serde(default)]
    pub target_mode: Option<String>,
    #[serde(default)]
    pub fractal: Option<FractalChange>,
    #[serde(default)]
    pub audio: Option<AudioChange>,
    #[serde(default)]
    pub ui: Option<UiDirectives>,
    pub rationale: String,
    pub provenance: Provenance,
}

impl Decision {
    /// Empty decision with a rationale; fill in with the `with_*` builders
    pub fn new(provenance: Provenance, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_mode: None,
            fractal: None,
            audio: None,
            ui: None,
            rationale: rationale.into(),
            provenance,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.target_mode = Some(mode.into());
        self
    }

    pub fn with_fractal(mut self, change: FractalChange) -> Self {
        self.fractal = Some(change);
        self
    }

    pub fn with_audio(mut self, change: AudioChange) -> Self {
        self.audio = Some(change);
        self
    }

    pub fn with_ui(mut self, ui: UiDirectives) -> Self {
        self.ui = if ui.is_empty() { None } else { Some(ui) };
        self
    }

    /// True when applying the decision would change nothing
    pub fn is_noop(&self) -> bool {
        self.target_mode.is_none()
            && self.fractal.is_none()
            && self.audio.is_none()
            && self.ui.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_builders() {
        let decision = Decision::new(Provenance::Rule, "idle user")
            .with_mode("energetic")
            .with_ui(UiDirectives::default());
        assert_eq!(decision.target_mode.as_deref(), Some("energetic"));
        assert!(decision.ui.is_none());
        assert!(!decision.is_noop());
        assert!(Decision::new(Provenance::Fallback, "x").is_noop());
    }

    #[test]
    fn test_provenance_serde() {
        assert_eq!(serde_json::to_string(&Provenance::Ai).unwrap(), r#""ai""#);
        assert_eq!(Provenance::Fallback.to_string(), "fallback");
    }
}
