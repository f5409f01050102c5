//! Orchestrator integration tests
//!
//! Recording collaborators and FakeTransport replace the renderer, the
//! synthesiser and the reasoning service. ManualClock drives telemetry time;
//! paused tokio time drives the periodic timer.

use prism_shared::{
    Beat, EventKind, InteractionEvent, IssueKind, ManualClock, OrchestratorEvent,
    OrchestratorStatus, PrismError, Provenance, RecommendationKind,
};
use prismd::collaborators::{RecordingAudio, RecordingUi, RecordingVisual};
use prismd::config::AdaptationConfig;
use prismd::decision::{DecisionEngine, EngineOptions};
use prismd::events::RecordingListener;
use prismd::orchestrator::{Collaborators, Orchestrator};
use prismd::queue::{QueueOptions, RequestQueue};
use prismd::transport::FakeTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const START_MS: u64 = 1_700_000_000_000;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    clock: ManualClock,
    visual: Arc<RecordingVisual>,
    audio: Arc<RecordingAudio>,
    events: Arc<RecordingListener>,
}

fn harness(config: AdaptationConfig, engine: DecisionEngine) -> Harness {
    let clock = ManualClock::new(START_MS);
    let visual = Arc::new(RecordingVisual::new());
    let audio = Arc::new(RecordingAudio::new());
    let collaborators = Collaborators::new(
        visual.clone(),
        audio.clone(),
        Arc::new(RecordingUi::new()),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(&config, engine, collaborators, Arc::new(clock.clone())).unwrap(),
    );
    let events = Arc::new(RecordingListener::new());
    orchestrator.subscribe(events.clone());
    Harness {
        orchestrator,
        clock,
        visual,
        audio,
        events,
    }
}

fn seeded() -> AdaptationConfig {
    AdaptationConfig {
        seed: Some(42),
        ..Default::default()
    }
}

fn rules_engine() -> DecisionEngine {
    DecisionEngine::new(
        None,
        EngineOptions {
            ai_enabled: false,
            seed: Some(42),
            ..Default::default()
        },
    )
}

fn ai_engine(transport: Arc<FakeTransport>) -> DecisionEngine {
    let queue = RequestQueue::new(
        transport,
        None,
        QueueOptions {
            request_delay: Duration::ZERO,
            simulate: false,
            ..Default::default()
        },
    );
    DecisionEngine::new(
        Some(Arc::new(queue)),
        EngineOptions {
            ai_enabled: true,
            seed: Some(42),
            ..Default::default()
        },
    )
}

// ============================================================================
// Decision provenance
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ai_reply_drives_mode_change() {
    let reply = r#"{"attention_state":"bored","fractal":{"type":"burning_ship","zoom":0.8},
        "audio":{"tempo":120.0},"rationale":"raise energy"}"#;
    let transport = Arc::new(FakeTransport::always(reply));
    let h = harness(seeded(), ai_engine(transport.clone()));

    let record = h.orchestrator.adapt().await.unwrap();
    assert_eq!(record.decision.provenance, Provenance::Ai);
    assert_eq!(record.decision.target_mode.as_deref(), Some("energetic"));
    assert!(record.succeeded());
    assert_eq!(h.orchestrator.current_mode(), "energetic");
    assert_eq!(h.visual.fractal_type(), "burning_ship");
    assert_eq!(h.audio.parameters().tempo, 120.0);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_ai_reply_falls_back_to_rules() {
    let transport = Arc::new(FakeTransport::always("I think the user is bored!"));
    let h = harness(seeded(), ai_engine(transport));

    let record = h.orchestrator.adapt().await.unwrap();
    assert_ne!(record.decision.provenance, Provenance::Ai);
    assert_eq!(h.events.count(EventKind::AdaptationOccurred), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_ai_failures_open_breaker() {
    let transport = Arc::new(FakeTransport::always("not json"));
    let h = harness(seeded(), ai_engine(transport.clone()));

    for _ in 0..3 {
        h.orchestrator.adapt().await;
    }
    assert_eq!(transport.call_count(), 3);

    // Cooling down: rules only, no dispatch
    h.orchestrator.adapt().await;
    assert_eq!(transport.call_count(), 3);
}

// ============================================================================
// Settings and modes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_low_adaptation_level_is_noop() {
    let transport = Arc::new(FakeTransport::always("{}"));
    let h = harness(seeded(), ai_engine(transport.clone()));
    h.orchestrator.set_adaptation_level(0.05);

    assert!(h.orchestrator.adapt().await.is_none());
    assert!(h.orchestrator.history().is_empty());
    assert!(h.orchestrator.decision_history().is_empty());
    assert_eq!(transport.call_count(), 0);
    assert_eq!(h.events.count(EventKind::AdaptationOccurred), 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_mode_rejects_unknown_and_switches_known() {
    let h = harness(seeded(), rules_engine());
    h.orchestrator.start().await.unwrap();

    let err = h.orchestrator.set_mode("nonexistent").await.unwrap_err();
    assert!(matches!(err, PrismError::UnknownMode(_)));
    assert_eq!(h.orchestrator.current_mode(), "contemplative");
    assert_eq!(h.events.count(EventKind::ModeChanged), 0);

    assert!(h.orchestrator.set_mode("energetic").await.unwrap());
    assert_eq!(h.orchestrator.adaptation_period(), Duration::from_millis(20_000));
    assert_eq!(h.orchestrator.timer_state(), (Duration::from_millis(20_000), true));
    assert_eq!(h.visual.fractal_type(), "burning_ship");
    assert_eq!(h.events.count(EventKind::ModeChanged), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mode_change_interaction_switches_mode() {
    let h = harness(seeded(), rules_engine());
    h.orchestrator.start().await.unwrap();
    h.orchestrator
        .handle_interaction(InteractionEvent::new("mode_change", START_MS).with_text("quantum"))
        .await;

    let changes: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.kind() == EventKind::ModeChanged)
        .collect();
    assert_eq!(
        changes[0],
        OrchestratorEvent::ModeChanged {
            from: "contemplative".to_string(),
            to: "quantum".to_string(),
        }
    );
    // Mode change interactions always run a cycle
    assert_eq!(h.orchestrator.history().len(), 1);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inactivity_introduces_novelty() {
    let h = harness(seeded(), rules_engine());
    h.orchestrator.start().await.unwrap();
    h.clock.advance(90_000);

    let record = h.orchestrator.adapt().await.unwrap();
    assert!(record.analysis.has_issue(IssueKind::Inactivity));
    let change = record
        .analysis
        .recommendation(RecommendationKind::ModeChange)
        .unwrap();
    assert_eq!(change.target.as_deref(), Some("energetic"));
    assert_eq!(record.decision.provenance, Provenance::Rule);
    assert!(record.decision.rationale.contains("No input for 90s"));
    assert!(record.decision.ui.as_ref().and_then(|u| u.prompt.as_ref()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timer_drives_cycles_until_paused() {
    let h = harness(seeded(), rules_engine());
    let (_input_tx, input_rx) = mpsc::channel(8);
    let (_beat_tx, beat_rx) = mpsc::channel(8);
    let task = tokio::spawn(Arc::clone(&h.orchestrator).run(input_rx, beat_rx));

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(h.orchestrator.status(), OrchestratorStatus::Running);
    let after_first = h.orchestrator.history().len();
    assert!(after_first >= 1);

    h.orchestrator.pause().unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.orchestrator.history().len(), after_first);

    h.orchestrator.stop();
    task.await.unwrap().unwrap();
    assert_eq!(h.orchestrator.status(), OrchestratorStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_zero_randomness_never_fires_quantum() {
    let config = AdaptationConfig {
        quantum_randomness: 0.0,
        ..seeded()
    };
    let h = harness(config, rules_engine());
    h.orchestrator.start().await.unwrap();

    for i in 0..10_000u64 {
        h.orchestrator.handle_beat(Beat {
            energy: 1.0,
            timestamp_ms: START_MS + i,
        });
    }
    assert_eq!(h.orchestrator.quantum().fired(), 0);
    assert_eq!(h.events.count(EventKind::QuantumEventFired), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_randomness_fires_some_quantum_events() {
    let config = AdaptationConfig {
        quantum_randomness: 1.0,
        ..seeded()
    };
    let h = harness(config, rules_engine());
    h.orchestrator.start().await.unwrap();

    for i in 0..1_000u64 {
        h.orchestrator.handle_beat(Beat {
            energy: 0.9,
            timestamp_ms: START_MS + i,
        });
    }
    let fired = h.orchestrator.quantum().fired() as usize;
    assert!(fired > 0);
    assert_eq!(h.events.count(EventKind::QuantumEventFired), fired);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_listener_does_not_stop_cycle() {
    let h = harness(seeded(), rules_engine());
    h.orchestrator
        .subscribe(Arc::new(|_: &OrchestratorEvent| -> Result<(), PrismError> {
            panic!("listener bug")
        }));

    assert!(h.orchestrator.adapt().await.is_some());
    assert_eq!(h.events.count(EventKind::AdaptationOccurred), 1);
}
