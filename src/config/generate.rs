pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGFERRY CONFIGURATION
# =============================================================================
# Process-wide settings for the agent. Each pipeline is a separate JSON
# document in the pipelines directory; its file name (without .json) is the
# configuration name.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logferry/config.yml
#   3. /etc/logferry/config.yml
#
# Values may reference environment variables with $env{NAME}.

# =============================================================================
# CHECKPOINT STORE
# =============================================================================
# Durable key/value state for plugins (read offsets, cursors). Entries of
# pipelines that are no longer configured are swept periodically.

checkpoint:
  dir: ~/.local/share/logferry
  file: checkpoint
  clean_interval: 10m
  max_clean_items: 1000

# =============================================================================
# PIPELINES
# =============================================================================

pipelines:
  dir: ~/.config/logferry/pipelines

# =============================================================================
# GLOBAL DEFAULTS
# =============================================================================
# Inherited by pipeline documents that carry no "global" section.

global:
  InputIntervalMs: 1000
  AggregatIntervalMs: 3000
  FlushIntervalMs: 3000
  DefaultLogQueueSize: 1000
  DefaultLogGroupQueueSize: 4
  DelayStopSec: 300

# =============================================================================
# CONTROL SURFACE (optional)
# =============================================================================
# HTTP endpoints: /health, /export/port, /pipelines, /metrics

control:
  listen: 127.0.0.1:7390

# =============================================================================
# RUNTIME
# =============================================================================

runtime:
  # Bound on each pipeline stop; slower pipelines are moved to the disabled set
  stop_timeout: 30s
  # Best-effort drain of leftover batches on exit
  max_flush_out_time: 5s
  always_online_for_stdout: false
  self_statistics: false
  default_flusher: flusher_stdout
"#
    .to_string()
}

/// A minimal pipeline document to drop into the pipelines directory.
pub fn generate_sample_pipeline() -> String {
    r#"{
  "global": {
    "AggregatIntervalMs": 1000
  },
  "inputs": [
    { "type": "metric_mock", "detail": { "IntervalMs": 1000, "Fields": { "content": "hello" } } }
  ],
  "processors": [
    { "type": "processor_add_fields", "detail": { "Fields": { "service": "demo" } } }
  ],
  "flushers": [
    { "type": "flusher_stdout", "detail": { "OnlyStdout": true } }
  ]
}
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_starter_config_parses() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.global.default_log_group_queue_size, 4);
        assert!(config.control.is_some());
    }

    #[test]
    fn test_sample_pipeline_is_json() {
        let doc: serde_json::Value = serde_json::from_str(&generate_sample_pipeline()).unwrap();
        assert_eq!(doc["inputs"][0]["type"], "metric_mock");
    }
}
