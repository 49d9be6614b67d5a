//! logferry: a host-resident telemetry agent.
//!
//! Pipelines are built from a declarative plugin graph
//! (inputs, processors, aggregators, flushers, extensions) and run as a set of
//! tokio tasks with bounded queues between the stages. The
//! [`manager::PipelineManager`] owns every live pipeline and swaps, pauses and
//! drains them when configuration changes.
//!
//! Initialisation order for the process-wide components:
//! 1. [`checkpoint::CheckpointStore`] (opened from the agent config)
//! 2. [`plugin::PluginRegistry`] (built-in factories plus any extra ones)
//! 3. [`manager::PipelineManager`], which owns the always-online cache and
//!    the checkpoint sweeper.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod control;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod runner;
pub mod wrapper;
