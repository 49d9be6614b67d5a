//! Plugins shipped with the agent.
//!
//! Every factory is registered under its type name by [`register_builtins`].
//! `metric_self_statistics` is registered separately by the pipeline manager
//! because it needs a view over the live pipeline table.

pub mod add_fields;
pub mod aggregator;
pub mod basic_auth;
pub mod checker;
pub mod http;
pub mod mock;
pub mod regex;
pub mod self_statistics;
pub mod stdout;

use crate::plugin::PluginRegistry;

pub use aggregator::{DefaultAggregator, DEFAULT_MAX_LOG_COUNT};
pub use basic_auth::BasicAuth;
pub use checker::{CapturedRecord, CheckerHandle, CheckerRegistry};

pub fn register_builtins(registry: &mut PluginRegistry) {
    mock::register(registry);
    regex::register(registry);
    add_fields::register(registry);
    aggregator::register(registry);
    stdout::register(registry);
    http::register(registry);
    basic_auth::register(registry);
    checker::register(registry, CheckerRegistry::global());
}
