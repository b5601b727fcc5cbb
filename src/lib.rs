pub mod autofix;
pub mod breaker;
pub mod budget_tracker;
pub mod canary;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod evaluation;
pub mod flake;
pub mod metrics;
pub mod orchestrator;
pub mod ports;
pub mod quarantine;
pub mod retry_policy;
pub mod risk;
pub mod scripted_backend;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use orchestrator::{EnginePorts, RunOrchestrator};
pub use service::{BuildLoopEngine, CaseReview};
pub use types::*;
