//! Plugin contracts, metadata and the factory registry.

pub mod context;
pub mod contracts;
pub mod meta;
pub mod registry;

pub use context::PluginContext;
pub use contracts::{
    AggregatorV1, AggregatorV2, Collector, Extension, FlusherV1, FlusherV2, GroupCollector,
    GroupQueue, InputMode, LogGroupQueue, MetricInputV1, MetricInputV2, ProcessorV1,
    ProcessorV2, ServiceInputV1, ServiceInputV2,
};
pub use meta::{PluginIdGenerator, PluginMeta};
pub use registry::{decode_detail, PluginFactory, PluginInstance, PluginRegistry};

use std::fmt;

/// The tagged discriminator of a plugin's role in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    MetricInput,
    ServiceInput,
    Processor,
    Aggregator,
    Flusher,
    Extension,
}

impl PluginKind {
    /// Infer the kind from a plugin type name prefix.
    pub fn from_type_name(plugin_type: &str) -> Option<Self> {
        const PREFIXES: [(&str, PluginKind); 7] = [
            ("metric_", PluginKind::MetricInput),
            ("service_", PluginKind::ServiceInput),
            ("processor_", PluginKind::Processor),
            ("aggregator_", PluginKind::Aggregator),
            ("flusher_", PluginKind::Flusher),
            ("extension_", PluginKind::Extension),
            ("ext_", PluginKind::Extension),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| plugin_type.starts_with(prefix))
            .map(|(_, kind)| *kind)
    }

    pub fn is_input(self) -> bool {
        matches!(self, PluginKind::MetricInput | PluginKind::ServiceInput)
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::MetricInput => "metric input",
            PluginKind::ServiceInput => "service input",
            PluginKind::Processor => "processor",
            PluginKind::Aggregator => "aggregator",
            PluginKind::Flusher => "flusher",
            PluginKind::Extension => "extension",
        };
        f.write_str(name)
    }
}

/// Dataflow shape of a pipeline: record-oriented (v1) or group-events (v2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContractVersion {
    #[default]
    V1,
    V2,
}

impl ContractVersion {
    /// Parse the `StructureType` global value. Unknown values are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "v1" => Some(ContractVersion::V1),
            "v2" => Some(ContractVersion::V2),
            _ => None,
        }
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractVersion::V1 => f.write_str("v1"),
            ContractVersion::V2 => f.write_str("v2"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("can't find plugin {0}")]
    UnknownType(String),

    #[error("invalid detail for plugin {plugin}: {source}")]
    InvalidDetail {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("plugin {plugin} failed to initialize: {message}")]
    InitFailed { plugin: String, message: String },

    #[error("queue is full")]
    QueueFull,

    #[error("plugin {plugin} does not implement the {version} {kind} contract")]
    Unsupported {
        plugin: String,
        kind: PluginKind,
        version: ContractVersion,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error("{0}")]
    Other(String),
}

impl PluginError {
    pub fn init_failed(plugin: impl Into<String>, message: impl fmt::Display) -> Self {
        PluginError::InitFailed {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_prefix() {
        assert_eq!(
            PluginKind::from_type_name("metric_mock"),
            Some(PluginKind::MetricInput)
        );
        assert_eq!(
            PluginKind::from_type_name("ext_basic_auth"),
            Some(PluginKind::Extension)
        );
        assert_eq!(
            PluginKind::from_type_name("extension_groupinfo"),
            Some(PluginKind::Extension)
        );
        assert_eq!(PluginKind::from_type_name("mystery"), None);
    }

    #[test]
    fn test_contract_version_parse() {
        assert_eq!(ContractVersion::parse("V2"), Some(ContractVersion::V2));
        assert_eq!(ContractVersion::parse("v1"), Some(ContractVersion::V1));
        assert_eq!(ContractVersion::parse("v3"), None);
    }
}
