//! Quantum events: rare one-shot perturbations layered over the main loop.
//!
//! Each trigger draws once against `randomness × 0.1 × context multiplier`.
//! A hit picks one effect uniformly and mutates the collaborators directly;
//! transient effects are undone later. Reversals are not reconciled with the
//! main cycle, the last write to a parameter wins.

use prism_shared::{
    AudioPatch, Clock, PrismError, QuantumEffect, QuantumEvent, QuantumTrigger, VisualPatch,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::lock;
use crate::collaborators::{AudioCollaborator, VisualCollaborator};
use crate::timer::TimerHandle;

/// Base probability scale applied to the randomness setting
const BASE_PROBABILITY: f64 = 0.1;

/// Probability of a quantum event for one trigger
pub fn event_probability(randomness: f64, trigger: &QuantumTrigger) -> f64 {
    let randomness = if randomness.is_finite() {
        randomness.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (randomness * BASE_PROBABILITY * trigger.context_multiplier()).clamp(0.0, 1.0)
}

pub struct QuantumEngine {
    visual: Arc<dyn VisualCollaborator>,
    audio: Arc<dyn AudioCollaborator>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    /// f64 bits
    randomness: AtomicU64,
    reversals: Mutex<Vec<TimerHandle>>,
    fired: AtomicU64,
}

impl QuantumEngine {
    pub fn new(
        visual: Arc<dyn VisualCollaborator>,
        audio: Arc<dyn AudioCollaborator>,
        clock: Arc<dyn Clock>,
        randomness: f64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let engine = Self {
            visual,
            audio,
            clock,
            rng: Mutex::new(rng),
            randomness: AtomicU64::new(0),
            reversals: Mutex::new(Vec::new()),
            fired: AtomicU64::new(0),
        };
        engine.set_randomness(randomness);
        engine
    }

    pub fn randomness(&self) -> f64 {
        f64::from_bits(self.randomness.load(Ordering::SeqCst))
    }

    pub fn set_randomness(&self, value: f64) {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        self.randomness.store(value.to_bits(), Ordering::SeqCst);
    }

    /// Events fired so far
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }

    /// Reversal timers not yet run
    pub fn pending_reversals(&self) -> usize {
        let mut reversals = lock(&self.reversals);
        reversals.retain(|r| !r.is_finished());
        reversals.len()
    }

    /// Draw once for this trigger. Does not touch the collaborators.
    pub fn roll(&self, trigger: QuantumTrigger) -> Option<QuantumEvent> {
        let probability = event_probability(self.randomness(), &trigger);
        if probability <= 0.0 {
            return None;
        }
        let effect = {
            let mut rng = lock(&self.rng);
            if !rng.gen_bool(probability) {
                return None;
            }
            *QuantumEffect::ALL.choose(&mut *rng)?
        };
        self.fired.fetch_add(1, Ordering::SeqCst);
        Some(QuantumEvent {
            id: Uuid::new_v4(),
            trigger,
            effect,
            timestamp_ms: self.clock.now_ms(),
        })
    }

    /// Perform the event's mutation and schedule its reversal
    pub async fn perform(&self, event: &QuantumEvent) -> Result<(), PrismError> {
        info!("Quantum event {} ({:?})", event.effect, event.trigger);
        match event.effect {
            QuantumEffect::ColorShift => {
                let shift = lock(&self.rng).gen_range(0.0..1.0);
                self.visual
                    .transition_parameters(
                        &VisualPatch {
                            color_shift: Some(shift),
                            ..Default::default()
                        },
                        1.0,
                    )
                    .await
            }
            QuantumEffect::RotationBurst => {
                let current = self.visual.state().await.parameters.rotation;
                let burst = lock(&self.rng).gen_range(PI / 4.0..PI);
                self.visual
                    .transition_parameters(
                        &VisualPatch {
                            rotation: Some(current + burst),
                            ..Default::default()
                        },
                        1.5,
                    )
                    .await
            }
            QuantumEffect::ZoomPulse => {
                // Out and back in sequence, no timer
                let zoom = self.visual.state().await.parameters.zoom;
                self.visual
                    .transition_parameters(
                        &VisualPatch {
                            zoom: Some(zoom * 1.5),
                            ..Default::default()
                        },
                        0.5,
                    )
                    .await?;
                self.visual
                    .transition_parameters(
                        &VisualPatch {
                            zoom: Some(zoom),
                            ..Default::default()
                        },
                        0.5,
                    )
                    .await
            }
            QuantumEffect::DimensionRift => {
                let original = self.visual.state().await.parameters.dimension;
                let (rift, delay) = {
                    let mut rng = lock(&self.rng);
                    (rng.gen_range(0.3..1.0), rng.gen_range(5.0..10.0))
                };
                self.visual
                    .transition_parameters(
                        &VisualPatch {
                            dimension: Some(rift),
                            ..Default::default()
                        },
                        1.0,
                    )
                    .await?;
                let visual = Arc::clone(&self.visual);
                self.schedule_reversal(event.effect, delay, async move {
                    visual
                        .transition_parameters(
                            &VisualPatch {
                                dimension: Some(original),
                                ..Default::default()
                            },
                            1.0,
                        )
                        .await
                });
                Ok(())
            }
            QuantumEffect::HarmonicShift => {
                let original = self.audio.state().await.parameters.harmonic_ratio;
                let (factor, delay) = {
                    let mut rng = lock(&self.rng);
                    let factor = [1.25, 1.5, 2.0][rng.gen_range(0..3)];
                    (factor, rng.gen_range(2.0..6.0))
                };
                self.audio
                    .transition_parameters(
                        &AudioPatch {
                            harmonic_ratio: Some(original * factor),
                            ..Default::default()
                        },
                        0.5,
                    )
                    .await?;
                let audio = Arc::clone(&self.audio);
                self.schedule_reversal(event.effect, delay, async move {
                    audio
                        .transition_parameters(
                            &AudioPatch {
                                harmonic_ratio: Some(original),
                                ..Default::default()
                            },
                            2.0,
                        )
                        .await
                });
                Ok(())
            }
        }
    }

    fn schedule_reversal<Fut>(&self, effect: QuantumEffect, delay_secs: f64, revert: Fut)
    where
        Fut: std::future::Future<Output = Result<(), PrismError>> + Send + 'static,
    {
        debug!("Reversing {} in {:.1}s", effect, delay_secs);
        let handle = TimerHandle::once(Duration::from_secs_f64(delay_secs), move || async move {
            match revert.await {
                Ok(()) => info!("Quantum {} reversed", effect),
                Err(e) => warn!("Quantum {} reversal failed: {}", effect, e),
            }
        });
        let mut reversals = lock(&self.reversals);
        reversals.retain(|r| !r.is_finished());
        reversals.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingAudio, RecordingVisual};
    use prism_shared::{InteractionKind, ManualClock};

    fn engine(randomness: f64, seed: u64) -> (QuantumEngine, Arc<RecordingVisual>, Arc<RecordingAudio>) {
        let visual = Arc::new(RecordingVisual::new());
        let audio = Arc::new(RecordingAudio::new());
        let engine = QuantumEngine::new(
            visual.clone(),
            audio.clone(),
            Arc::new(ManualClock::new(0)),
            randomness,
            Some(seed),
        );
        (engine, visual, audio)
    }

    #[test]
    fn test_probability_formula() {
        let beat = QuantumTrigger::Beat { energy: 0.9 };
        assert!((event_probability(0.5, &beat) - 0.1).abs() < 1e-12);
        let hot = QuantumTrigger::Interaction {
            kind: InteractionKind::Drag,
            intensity: Some(0.9),
        };
        assert!((event_probability(1.0, &hot) - 0.3).abs() < 1e-12);
        assert_eq!(event_probability(f64::NAN, &hot), 0.0);
    }

    #[test]
    fn test_zero_randomness_never_fires() {
        let (engine, _, _) = engine(0.0, 9);
        let triggers = [
            QuantumTrigger::Beat { energy: 1.0 },
            QuantumTrigger::Interaction {
                kind: InteractionKind::Click,
                intensity: Some(1.0),
            },
        ];
        for i in 0..10_000 {
            assert!(engine.roll(triggers[i % 2].clone()).is_none());
        }
        assert_eq!(engine.fired(), 0);
    }

    #[test]
    fn test_fire_rate_tracks_probability() {
        let (engine, _, _) = engine(1.0, 3);
        let hits = (0..10_000)
            .filter(|_| engine.roll(QuantumTrigger::Beat { energy: 0.2 }).is_some())
            .count();
        // p = 0.1
        assert!((800..1_200).contains(&hits), "hits = {}", hits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harmonic_shift_reverts_after_timer() {
        let (engine, _, audio) = engine(1.0, 1);
        let original = audio.parameters().harmonic_ratio;
        let event = QuantumEvent {
            id: Uuid::new_v4(),
            trigger: QuantumTrigger::Beat { energy: 0.5 },
            effect: QuantumEffect::HarmonicShift,
            timestamp_ms: 0,
        };
        engine.perform(&event).await.unwrap();
        assert!(audio.parameters().harmonic_ratio > original);
        assert_eq!(engine.pending_reversals(), 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(audio.parameters().harmonic_ratio, original);
        assert_eq!(engine.pending_reversals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_rift_reverts_within_ten_seconds() {
        let (engine, visual, _) = engine(1.0, 4);
        let original = visual.parameters().dimension;
        let event = QuantumEvent {
            id: Uuid::new_v4(),
            trigger: QuantumTrigger::Beat { energy: 0.5 },
            effect: QuantumEffect::DimensionRift,
            timestamp_ms: 0,
        };
        engine.perform(&event).await.unwrap();
        let rift = visual.parameters().dimension;
        assert!((0.3..1.0).contains(&rift));
        assert_ne!(rift, original);
        assert_eq!(engine.pending_reversals(), 1);

        // Reversal is scheduled 5-10s out
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(visual.parameters().dimension, rift);
        assert_eq!(engine.pending_reversals(), 1);

        tokio::time::sleep(Duration::from_millis(5_200)).await;
        assert_eq!(visual.parameters().dimension, original);
        assert_eq!(engine.pending_reversals(), 0);
    }

    #[tokio::test]
    async fn test_zoom_pulse_returns_in_sequence() {
        let (engine, visual, _) = engine(1.0, 1);
        let event = QuantumEvent {
            id: Uuid::new_v4(),
            trigger: QuantumTrigger::Beat { energy: 0.5 },
            effect: QuantumEffect::ZoomPulse,
            timestamp_ms: 0,
        };
        engine.perform(&event).await.unwrap();
        assert_eq!(visual.calls().len(), 2);
        assert_eq!(visual.parameters().zoom, 1.0);
        assert_eq!(engine.pending_reversals(), 0);
    }
}
