//! Experience modes: named bundles of visual preset, audio preset and
//! adaptation cadence.

use serde::{Deserialize, Serialize};

use crate::telemetry::{AudioPatch, VisualPatch};

pub const CONTEMPLATIVE: &str = "contemplative";
pub const EXPLORATORY: &str = "exploratory";
pub const ENERGETIC: &str = "energetic";
pub const QUANTUM: &str = "quantum";

/// Named bundle of presets. Read-only at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    /// Fractal type selected when the mode is entered
    pub visual_preset: String,
    pub visual: VisualPatch,
    pub audio_preset: String,
    pub audio: AudioPatch,
    /// Adaptation period override in milliseconds
    pub adaptation_period_ms: u64,
}

/// Fixed mode catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeCatalog {
    modes: Vec<Mode>,
}

impl ModeCatalog {
    pub fn new(modes: Vec<Mode>) -> Self {
        Self { modes }
    }

    pub fn get(&self, name: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modes.iter().map(|m| m.name.as_str()).collect()
    }

    /// Add or replace a mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.modes.retain(|m| m.name != mode.name);
        self.modes.push(mode);
        self
    }
}

impl Default for ModeCatalog {
    fn default() -> Self {
        Self::new(vec![
            Mode {
                name: CONTEMPLATIVE.to_string(),
                visual_preset: "julia".to_string(),
                visual: VisualPatch {
                    zoom: Some(1.2),
                    iterations: Some(150),
                    color_shift: Some(0.6),
                    ..Default::default()
                },
                audio_preset: "ambient_drone".to_string(),
                audio: AudioPatch {
                    tempo: Some(60.0),
                    volume: Some(0.5),
                    base_frequency: Some(174.0),
                    binaural_beat: Some(6.0),
                    rhythm_enabled: Some(false),
                    reverb: Some(0.7),
                    ..Default::default()
                },
                adaptation_period_ms: 45_000,
            },
            Mode {
                name: EXPLORATORY.to_string(),
                visual_preset: "mandelbrot".to_string(),
                visual: VisualPatch {
                    iterations: Some(200),
                    color_shift: Some(0.3),
                    ..Default::default()
                },
                audio_preset: "generative_melody".to_string(),
                audio: AudioPatch {
                    tempo: Some(90.0),
                    volume: Some(0.6),
                    base_frequency: Some(220.0),
                    binaural_beat: Some(10.0),
                    rhythm_enabled: Some(true),
                    ..Default::default()
                },
                adaptation_period_ms: 30_000,
            },
            Mode {
                name: ENERGETIC.to_string(),
                visual_preset: "burning_ship".to_string(),
                visual: VisualPatch {
                    zoom: Some(0.8),
                    iterations: Some(120),
                    color_shift: Some(0.9),
                    ..Default::default()
                },
                audio_preset: "pulse".to_string(),
                audio: AudioPatch {
                    tempo: Some(128.0),
                    volume: Some(0.75),
                    base_frequency: Some(330.0),
                    binaural_beat: Some(18.0),
                    rhythm_enabled: Some(true),
                    reverb: Some(0.2),
                    ..Default::default()
                },
                adaptation_period_ms: 20_000,
            },
            Mode {
                name: QUANTUM.to_string(),
                visual_preset: "quaternion".to_string(),
                visual: VisualPatch {
                    iterations: Some(80),
                    dimension: Some(0.5),
                    ..Default::default()
                },
                audio_preset: "granular_cloud".to_string(),
                audio: AudioPatch {
                    tempo: Some(100.0),
                    base_frequency: Some(261.6),
                    harmonic_ratio: Some(1.618),
                    binaural_beat: Some(40.0),
                    ..Default::default()
                },
                adaptation_period_ms: 15_000,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = ModeCatalog::default();
        assert_eq!(catalog.names(), vec![CONTEMPLATIVE, EXPLORATORY, ENERGETIC, QUANTUM]);
        assert_eq!(catalog.get(ENERGETIC).unwrap().adaptation_period_ms, 20_000);
        assert!(!catalog.contains("nonexistent"));
    }

    #[test]
    fn test_catalog_extension_replaces_by_name() {
        let catalog = ModeCatalog::default().with_mode(Mode {
            name: ENERGETIC.to_string(),
            visual_preset: "tricorn".to_string(),
            visual: VisualPatch::default(),
            audio_preset: "pulse".to_string(),
            audio: AudioPatch::default(),
            adaptation_period_ms: 10_000,
        });
        assert_eq!(catalog.names().len(), 4);
        assert_eq!(catalog.get(ENERGETIC).unwrap().visual_preset, "tricorn");
    }
}
