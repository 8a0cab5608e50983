//! Shared types, error model, and configuration for CaseBrief.
//!
//! This crate is the foundation depended on by all other CaseBrief crates.
//! It provides:
//! - [`CaseBriefError`] and [`StageError`], the error types
//! - Domain types ([`CaseAggregate`], [`AnalysisStageRecord`], [`StageDescriptor`], [`CaseId`])
//! - Configuration ([`AppConfig`], [`OrchestratorConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalysisConfig, AppConfig, DEFAULT_MAX_CONTEXT_CHARS, OrchestratorConfig, StorageConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{
    CaseBriefError, GENERIC_SERVICE_MESSAGE, RATE_LIMIT_MESSAGE, Result, StageError,
};
pub use types::{AnalysisStageRecord, CaseAggregate, CaseId, StageDescriptor};
