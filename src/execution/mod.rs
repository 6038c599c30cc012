//! Task graph execution.
//!
//! This module provides the [`Executor`], which provisions environments and
//! runs tasks depth-first, and the per-run state it records.

mod executor;
mod run;

pub use executor::{DEFAULT_PREFIX, DEFAULT_STOP_SIGNAL, Executor, ExecutorConfig};
pub use run::{RunReport, RunState, TaskResult};
