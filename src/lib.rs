//! RecipeFlow - Composable Step-Graph Recipes
//!
//! Compose reusable packs of steps into one dependency graph, resolve the
//! adapters each step may use, run the graph to a typed outcome, and suspend
//! mid-graph to wait for a human or an external system before resuming from
//! durable state.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`recipe`]: packs, contracts, definitions, graph compilation and handles
//! - [`adapters`]: capability traits, plugin merging and provider resolution
//! - [`execution`]: the pipeline executor, working state and outcomes
//! - [`session`]: pause snapshots, session stores and rollback
//! - [`diagnostics`]: diagnostic entries and the escalation policy
//! - [`config`] and [`runtime`]: engine settings and the shared runtime
//!
//! # Example
//!
//! ```rust,no_run
//! use recipeflow::execution::{PauseRequest, StepOutput};
//! use recipeflow::recipe::{Pack, RecipeDefinition, RecipeHandle, ResumeOptions, RunOptions, StepBuilder};
//! use recipeflow::{EngineConfig, Runtime};
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new(EngineConfig::load("recipeflow.yaml")?)?;
//!
//!     let review = Pack::new("hitl")
//!         .step(StepBuilder::sync("draft", |_| Ok(StepOutput::set("draft", json!("v1")))))
//!         .step(
//!             StepBuilder::sync("review", |ctx| match ctx.resume_input() {
//!                 Some(decision) => Ok(StepOutput::set("decision", decision.clone())),
//!                 None => Ok(StepOutput::pause(PauseRequest::human())),
//!             })
//!             .depends_on("draft"),
//!         );
//!     let handle = RecipeHandle::from_fn("hitl", move |_| RecipeDefinition::new("hitl").pack(review.clone()));
//!
//!     let outcome = handle.run_blocking(&runtime, json!({}), RunOptions::default());
//!     if let Some(token) = outcome.token() {
//!         let done = handle.resume_blocking(&runtime, token, ResumeOptions::default().input(json!("approve")));
//!         println!("{}", done.status());
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod execution;
pub mod recipe;
pub mod runtime;
pub mod session;

// Re-export commonly used types
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, DiagnosticsMode};
pub use error::{EngineError, Result};
pub use execution::Outcome;
pub use recipe::{Pack, RecipeHandle, StepBuilder};
pub use runtime::Runtime;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RecipeFlow";
