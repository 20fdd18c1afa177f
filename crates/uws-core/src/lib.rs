//! uws-core: orchestrator configuration for the UWS health supervisor.

pub mod config;

pub use config::{
    ConfigError, OrchestratorConfig, ResolvedOrchestrator, ResolvedService, parse_duration,
};
