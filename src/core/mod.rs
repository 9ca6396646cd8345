//! Core domain models for local pipeline runs
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, the jobs they expand into, and job states.

pub mod job;
pub mod loader;
pub mod pipeline;
pub mod state;
pub mod step;

pub use job::*;
pub use loader::LoadError;
pub use pipeline::*;
pub use state::*;
pub use step::*;
