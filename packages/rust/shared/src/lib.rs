//! Shared types, error model, and configuration for pubflow.
//!
//! This crate is the foundation depended on by all other pubflow crates.
//! It provides:
//! - [`PipelineError`]: the unified error type
//! - The persisted state model ([`Document`], [`EntityRecord`], [`StepRecord`], [`WorkflowStep`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AuditConfig, CommandSpec, DefaultsConfig, RunConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{PipelineError, Result};
pub use types::{
    CURRENT_DOCUMENT_VERSION, CheckpointEvent, Document, EntityError, EntityRecord, EntityStatus,
    GlobalState, MAX_ATTEMPTS, ParseStepError, RunId, StepHistoryEntry, StepRecord, StepStatus,
    StepTable, WorkflowStep,
};
