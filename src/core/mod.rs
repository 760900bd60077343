//! Core domain models for pipelines
//!
//! This module defines the fundamental data structures that represent
//! pipelines, stages, jobs, steps and their configuration.

pub mod condition;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod stage;
pub mod state;
pub mod step;

pub use condition::{Condition, ConditionError, ConditionScope};
pub use context::*;
pub use pipeline::*;
pub use stage::*;
pub use state::*;
pub use step::*;
