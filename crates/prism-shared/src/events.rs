//! Orchestrator notifications and quantum event types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::decision::Provenance;
use crate::telemetry::InteractionKind;

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Paused,
    /// Terminal
    Stopped,
}

/// One-shot perturbations a quantum event can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantumEffect {
    ColorShift,
    ZoomPulse,
    RotationBurst,
    DimensionRift,
    HarmonicShift,
}

impl QuantumEffect {
    pub const ALL: [QuantumEffect; 5] = [
        QuantumEffect::ColorShift,
        QuantumEffect::ZoomPulse,
        QuantumEffect::RotationBurst,
        QuantumEffect::DimensionRift,
        QuantumEffect::HarmonicShift,
    ];

    /// Effects that are undone after a delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuantumEffect::ZoomPulse | QuantumEffect::DimensionRift | QuantumEffect::HarmonicShift
        )
    }
}

impl fmt::Display for QuantumEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuantumEffect::ColorShift => "color_shift",
            QuantumEffect::ZoomPulse => "zoom_pulse",
            QuantumEffect::RotationBurst => "rotation_burst",
            QuantumEffect::DimensionRift => "dimension_rift",
            QuantumEffect::HarmonicShift => "harmonic_shift",
        };
        write!(f, "{}", s)
    }
}

/// What caused a quantum draw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum QuantumTrigger {
    Beat { energy: f64 },
    Interaction { kind: InteractionKind, intensity: Option<f64> },
}

impl QuantumTrigger {
    /// Probability multiplier for the trigger context
    pub fn context_multiplier(&self) -> f64 {
        match self {
            QuantumTrigger::Beat { energy } if *energy > crate::telemetry::HIGH_INTENSITY => 2.0,
            QuantumTrigger::Interaction {
                intensity: Some(i), ..
            } if *i > crate::telemetry::HIGH_INTENSITY => 3.0,
            _ => 1.0,
        }
    }
}

/// Ephemeral record of a fired quantum event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantumEvent {
    pub id: Uuid,
    pub trigger: QuantumTrigger,
    pub effect: QuantumEffect,
    pub timestamp_ms: u64,
}

/// Notifications published to external listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ModeChanged {
        from: String,
        to: String,
    },
    AdaptationOccurred {
        timestamp_ms: u64,
        provenance: Provenance,
        rationale: String,
        failed_changes: usize,
    },
    QuantumEventFired(QuantumEvent),
}

/// Event category, used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModeChanged,
    AdaptationOccurred,
    QuantumEventFired,
}

impl OrchestratorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OrchestratorEvent::ModeChanged { .. } => EventKind::ModeChanged,
            OrchestratorEvent::AdaptationOccurred { .. } => EventKind::AdaptationOccurred,
            OrchestratorEvent::QuantumEventFired(_) => EventKind::QuantumEventFired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_multipliers() {
        assert_eq!(QuantumTrigger::Beat { energy: 0.9 }.context_multiplier(), 2.0);
        assert_eq!(QuantumTrigger::Beat { energy: 0.5 }.context_multiplier(), 1.0);
        let hot = QuantumTrigger::Interaction {
            kind: InteractionKind::Drag,
            intensity: Some(0.95),
        };
        assert_eq!(hot.context_multiplier(), 3.0);
        let plain = QuantumTrigger::Interaction {
            kind: InteractionKind::Click,
            intensity: None,
        };
        assert_eq!(plain.context_multiplier(), 1.0);
    }

    #[test]
    fn test_transient_effects() {
        let transient: Vec<_> = QuantumEffect::ALL.iter().filter(|e| e.is_transient()).collect();
        assert_eq!(transient.len(), 3);
        assert!(!QuantumEffect::ColorShift.is_transient());
    }

    #[test]
    fn test_event_json_tag() {
        let event = OrchestratorEvent::ModeChanged {
            from: "contemplative".to_string(),
            to: "energetic".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "mode_changed");
        assert_eq!(event.kind(), EventKind::ModeChanged);
    }
}
