//! Crate Error Types
//!
//! Build-time and infrastructure failures. Failures that happen while a
//! recipe runs never surface here; they become an error [`Outcome`] with
//! diagnostics attached.
//!
//! [`Outcome`]: crate::execution::Outcome

use thiserror::Error;

/// Errors raised while loading configuration, compiling a step graph or
/// talking to a session store.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step graph contains a dependency cycle involving: {0}")]
    Cycle(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
