//! Configuration types and loading.
//!
//! Provides all configuration structures for taskmill:
//! - `MillConfig`: Top-level configuration with validation
//! - `RunnerConfig`, `SupervisedConfig`: runner selection and child-process settings
//! - `CacheConfig`, `AgentDefaults`: backend selection and definition defaults

mod settings;

pub use settings::{
    AgentDefaults, CacheConfig, MillConfig, RunnerConfig, SupervisedConfig,
    DEFAULT_CHECK_PROCESS_MS, DEFAULT_LOG_THROTTLE_MS, DEFAULT_TAIL_SIZE,
};
