//! Shared types, error model, and configuration for docflow.
//!
//! This crate is the foundation depended on by all other docflow crates.
//! It provides:
//! - [`DocflowError`], the unified error type
//! - Domain types ([`WorkflowContext`], [`DocumentRef`], [`JobStatus`], [`WorkflowState`])
//! - Configuration ([`AppConfig`], [`WorkflowConfig`], [`RetryPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalysisConfig, AppConfig, RetryConfig, RetryPolicy, StorageConfig, WorkflowConfig,
    WorkflowSection, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{DocflowError, Result};
pub use types::{
    DocumentRef, ExecutionId, JobId, JobStatus, RequestId, StartRequest, WorkflowContext,
    WorkflowState,
};
