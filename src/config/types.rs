use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide agent configuration, read from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub checkpoint: CheckpointSettings,
    pub pipelines: PipelinesSettings,
    /// Defaults inherited by pipeline documents without a `global` section.
    pub global: GlobalConfig,
    pub control: Option<ControlSettings>,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub dir: PathBuf,
    pub file: String,
    #[serde(with = "humantime_serde")]
    pub clean_interval: Duration,
    pub max_clean_items: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.local/share/logferry"),
            file: "checkpoint".to_string(),
            clean_interval: Duration::from_secs(600),
            max_clean_items: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelinesSettings {
    /// Directory of `<name>.json` pipeline documents.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    pub always_online_for_stdout: bool,
    #[serde(with = "humantime_serde")]
    pub max_flush_out_time: Duration,
    pub self_statistics: bool,
    pub default_flusher: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            always_online_for_stdout: false,
            max_flush_out_time: Duration::from_secs(5),
            self_statistics: false,
            default_flusher: "flusher_stdout".to_string(),
        }
    }
}

/// The `global` section of a pipeline document.
///
/// Wire names are PascalCase (`InputIntervalMs`, `DefaultLogQueueSize`, ...).
/// Missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GlobalConfig {
    pub input_interval_ms: u64,
    pub aggregat_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub default_log_queue_size: usize,
    pub default_log_group_queue_size: usize,
    pub tags: BTreeMap<String, String>,
    pub always_online: bool,
    pub delay_stop_sec: u64,
    pub structure_type: String,
    pub using_old_content_tag: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            input_interval_ms: 1000,
            aggregat_interval_ms: 3000,
            flush_interval_ms: 3000,
            default_log_queue_size: 1000,
            default_log_group_queue_size: 4,
            tags: BTreeMap::new(),
            always_online: false,
            delay_stop_sec: 300,
            structure_type: "v1".to_string(),
            using_old_content_tag: false,
        }
    }
}

impl GlobalConfig {
    /// Apply the keys present in `value` on top of `self`.
    pub fn overlay(&self, value: &serde_json::Value) -> Result<GlobalConfig, serde_json::Error> {
        let mut merged = serde_json::to_value(self)?;
        if let (Some(base), Some(patch)) = (merged.as_object_mut(), value.as_object()) {
            for (key, v) in patch {
                base.insert(key.clone(), v.clone());
            }
        }
        serde_json::from_value(merged)
    }

    pub fn input_interval(&self) -> Duration {
        Duration::from_millis(self.input_interval_ms)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_millis(self.aggregat_interval_ms)
    }

    pub fn delay_stop(&self) -> Duration {
        Duration::from_secs(self.delay_stop_sec)
    }
}
