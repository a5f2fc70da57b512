//! Recipe Composition Module
//!
//! Everything that describes a recipe before it runs.
//!
//! # Components
//!
//! - [`contract`]: named recipe contracts and the registry holding them
//! - [`pack`]: packs, step builders and step ids
//! - [`definition`]: merged packs and defaults, plus the introspection plan
//! - [`graph`]: compilation into a validated step graph
//! - [`handle`]: the composition surface callers build and run through

pub mod contract;
pub mod definition;
pub mod graph;
pub mod handle;
pub mod pack;

pub use contract::{RecipeContract, RecipeRegistry};
pub use definition::{Plan, PlanPack, PlanStep, RecipeDefinition};
pub use graph::StepGraph;
pub use handle::{CompiledRecipe, RecipeFactory, RecipeHandle, ResumeOptions, RunOptions, Usable};
pub use pack::{Pack, StepBuilder, StepId, StepMode, StepSpec};
