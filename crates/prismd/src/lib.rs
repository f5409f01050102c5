//! Prism daemon library - exposes modules for testing.

pub mod analyzer;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod decision;
pub mod events;
pub mod orchestrator;
pub mod quantum;
pub mod queue;
pub mod timer;
pub mod transport;

pub use analyzer::StateAnalyzer;
pub use cache::ResponseCache;
pub use config::Config;
pub use decision::DecisionEngine;
pub use events::EventBus;
pub use orchestrator::{AdaptationRecord, Collaborators, Orchestrator};
pub use queue::RequestQueue;
