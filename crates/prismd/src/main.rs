//! Prism Daemon - adaptive audiovisual control loop
//!
//! Runs headless: interactions arrive as JSON lines on stdin, beats are
//! synthesized from the audio tempo, and changes are logged.

use anyhow::{Context, Result};
use prism_shared::{Beat, Clock, InteractionEvent, OrchestratorEvent, PrismError, SystemClock};
use prismd::cache::{FileStore, ResponseCache};
use prismd::collaborators::{AudioCollaborator, HeadlessAudio, HeadlessUi, HeadlessVisual};
use prismd::config::Config;
use prismd::decision::{DecisionEngine, EngineOptions};
use prismd::orchestrator::{Collaborators, Orchestrator};
use prismd::queue::{QueueOptions, RequestQueue};
use prismd::transport::HttpTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const INPUT_CHANNEL_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "Prism Daemon v{} starting at {}",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now().to_rfc3339()
    );

    let config = Config::load();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Response cache
    let cache = if config.cache.enabled {
        let mut cache = ResponseCache::new(
            config.cache.max_entries,
            config.cache.default_ttl(),
            Arc::clone(&clock),
        );
        if let Some(path) = config.cache.resolved_path() {
            info!("Response cache persisted at {}", path.display());
            cache = cache.with_store(Box::new(FileStore::new(path)));
        }
        let cache = Arc::new(cache);
        cache.spawn_sweeper(config.cache.sweep_interval());
        Some(cache)
    } else {
        None
    };

    // Reasoning path
    let queue = if config.reasoning.enabled {
        let transport = HttpTransport::new(&config.reasoning)
            .context("Failed to build reasoning transport")?;
        Some(Arc::new(RequestQueue::new(
            Arc::new(transport),
            cache,
            QueueOptions::from_config(&config.reasoning, &config.cache),
        )))
    } else {
        info!("Reasoning service disabled, rule-based decisions only");
        None
    };
    let engine = DecisionEngine::new(
        queue,
        EngineOptions::from_config(&config.reasoning, config.adaptation.seed),
    );

    let audio = Arc::new(HeadlessAudio::new());
    let collaborators = Collaborators::new(
        Arc::new(HeadlessVisual::new()),
        audio.clone(),
        Arc::new(HeadlessUi),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(&config.adaptation, engine, collaborators, clock.clone())
            .context("Failed to create orchestrator")?,
    );
    orchestrator.subscribe(Arc::new(|event: &OrchestratorEvent| -> Result<(), PrismError> {
        debug!("Event: {}", serde_json::to_string(event)?);
        Ok(())
    }));

    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
    let (beat_tx, beat_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
    tokio::spawn(read_interactions(input_tx));
    tokio::spawn(synthesize_beats(audio, clock, beat_tx));

    let loop_task = tokio::spawn(Arc::clone(&orchestrator).run(input_rx, beat_rx));
    info!("Prism Daemon ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    orchestrator.stop();
    loop_task.await??;

    Ok(())
}

/// One JSON interaction per line on stdin
async fn read_interactions(tx: mpsc::Sender<InteractionEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<InteractionEvent>(&line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed interaction: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
    debug!("Interaction reader finished");
}

/// Emit a beat per audio tempo tick, with energy following volume
async fn synthesize_beats(
    audio: Arc<HeadlessAudio>,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<Beat>,
) {
    loop {
        let parameters = audio.state().await.parameters;
        let tempo = parameters.tempo.clamp(20.0, 300.0);
        tokio::time::sleep(Duration::from_secs_f64(60.0 / tempo)).await;

        let beat = Beat {
            energy: parameters.volume.clamp(0.0, 1.0),
            timestamp_ms: clock.now_ms(),
        };
        if tx.send(beat).await.is_err() {
            break;
        }
    }
}
