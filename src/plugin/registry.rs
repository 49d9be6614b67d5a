use super::contracts::{
    AggregatorV1, AggregatorV2, Extension, FlusherV1, FlusherV2, MetricInputV1, MetricInputV2,
    ProcessorV1, ProcessorV2, ServiceInputV1, ServiceInputV2,
};
use super::{ContractVersion, PluginError, PluginKind};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A freshly constructed plugin tagged with its kind and contract variant.
pub enum PluginInstance {
    MetricInputV1(Box<dyn MetricInputV1>),
    MetricInputV2(Box<dyn MetricInputV2>),
    ServiceInputV1(Box<dyn ServiceInputV1>),
    ServiceInputV2(Box<dyn ServiceInputV2>),
    ProcessorV1(Box<dyn ProcessorV1>),
    ProcessorV2(Box<dyn ProcessorV2>),
    AggregatorV1(Box<dyn AggregatorV1>),
    AggregatorV2(Box<dyn AggregatorV2>),
    FlusherV1(Box<dyn FlusherV1>),
    FlusherV2(Box<dyn FlusherV2>),
    Extension(Box<dyn Extension>),
}

impl PluginInstance {
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginInstance::MetricInputV1(_) | PluginInstance::MetricInputV2(_) => {
                PluginKind::MetricInput
            }
            PluginInstance::ServiceInputV1(_) | PluginInstance::ServiceInputV2(_) => {
                PluginKind::ServiceInput
            }
            PluginInstance::ProcessorV1(_) | PluginInstance::ProcessorV2(_) => {
                PluginKind::Processor
            }
            PluginInstance::AggregatorV1(_) | PluginInstance::AggregatorV2(_) => {
                PluginKind::Aggregator
            }
            PluginInstance::FlusherV1(_) | PluginInstance::FlusherV2(_) => PluginKind::Flusher,
            PluginInstance::Extension(_) => PluginKind::Extension,
        }
    }

    /// `None` for extensions, which are shared by both variants.
    pub fn version(&self) -> Option<ContractVersion> {
        match self {
            PluginInstance::MetricInputV1(_)
            | PluginInstance::ServiceInputV1(_)
            | PluginInstance::ProcessorV1(_)
            | PluginInstance::AggregatorV1(_)
            | PluginInstance::FlusherV1(_) => Some(ContractVersion::V1),
            PluginInstance::MetricInputV2(_)
            | PluginInstance::ServiceInputV2(_)
            | PluginInstance::ProcessorV2(_)
            | PluginInstance::AggregatorV2(_)
            | PluginInstance::FlusherV2(_) => Some(ContractVersion::V2),
            PluginInstance::Extension(_) => None,
        }
    }
}

/// Builds a plugin for the requested contract variant from its JSON detail.
pub type PluginFactory =
    Arc<dyn Fn(ContractVersion, Option<&Value>) -> Result<PluginInstance, PluginError> + Send + Sync>;

/// Decode a plugin's `detail` object; a missing or null detail yields the
/// plugin's defaults.
pub fn decode_detail<T>(plugin: &str, detail: Option<&Value>) -> Result<T, PluginError>
where
    T: DeserializeOwned + Default,
{
    match detail {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|source| PluginError::InvalidDetail {
                plugin: plugin.to_string(),
                source,
            })
        }
    }
}

/// Map from plugin type name to factory.
///
/// Populated once at process start; cloning shares the factories.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, plugin_type: &str, factory: F)
    where
        F: Fn(ContractVersion, Option<&Value>) -> Result<PluginInstance, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(plugin_type.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, plugin_type: &str) -> bool {
        self.factories.contains_key(plugin_type)
    }

    pub fn plugin_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn create(
        &self,
        plugin_type: &str,
        version: ContractVersion,
        detail: Option<&Value>,
    ) -> Result<PluginInstance, PluginError> {
        let factory = self
            .factories
            .get(plugin_type)
            .ok_or_else(|| PluginError::UnknownType(plugin_type.to_string()))?;
        let instance = factory(version, detail)?;
        if let Some(built) = instance.version() {
            if built != version {
                return Err(PluginError::Unsupported {
                    plugin: plugin_type.to_string(),
                    kind: instance.kind(),
                    version,
                });
            }
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default, rename_all = "PascalCase")]
    struct Detail {
        max_log_count: usize,
        topic: String,
    }

    #[test]
    fn test_decode_detail_defaults() {
        let empty: Detail = decode_detail("x", None).unwrap();
        assert_eq!(empty, Detail::default());

        let value = serde_json::json!({"MaxLogCount": 5});
        let detail: Detail = decode_detail("x", Some(&value)).unwrap();
        assert_eq!(detail.max_log_count, 5);
        assert!(detail.topic.is_empty());

        let bad = serde_json::json!({"MaxLogCount": "many"});
        assert!(matches!(
            decode_detail::<Detail>("x", Some(&bad)),
            Err(PluginError::InvalidDetail { .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.create("flusher_nowhere", ContractVersion::V1, None),
            Err(PluginError::UnknownType(_))
        ));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = PluginRegistry::with_builtins();
        for name in [
            "aggregator_default",
            "flusher_stdout",
            "flusher_http",
            "processor_regex",
            "processor_add_fields",
            "metric_mock",
            "service_mock",
            "ext_basic_auth",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let registry = PluginRegistry::with_builtins();
        assert!(matches!(
            registry.create("processor_regex", ContractVersion::V2, None),
            Err(PluginError::Unsupported { .. })
        ));
    }
}
