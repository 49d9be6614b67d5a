use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unset_env_refs, ALWAYS_ONLINE_FOR_STDOUT_ENV};
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse, expand and validate a YAML document.
pub fn parse_config(yaml: &str) -> Result<AgentConfig, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: AgentConfig = if yaml.trim().is_empty() {
        AgentConfig::default()
    } else {
        serde_yaml::from_str(&yaml)?
    };

    expand_paths(&mut config);
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let unset = unset_env_refs(yaml);
    match unset.first() {
        None => Ok(()),
        Some(first) => Err(ConfigError::Validation(format!(
            "environment variables are not set: {}\n\n\
             Set them (e.g. export {}=...) or replace the references in the config file.",
            unset.join(", "),
            first
        ))),
    }
}

fn expand_paths(config: &mut AgentConfig) {
    config.checkpoint.dir = expand_tilde(&config.checkpoint.dir);
    if let Some(dir) = config.pipelines.dir.as_mut() {
        *dir = expand_tilde(dir);
    }
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(value) = std::env::var(ALWAYS_ONLINE_FOR_STDOUT_ENV) {
        config.runtime.always_online_for_stdout = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        );
    }
}

fn validate_config(config: &AgentConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.checkpoint.file.trim().is_empty() {
        errors.push("checkpoint.file cannot be empty".to_string());
    }
    if config.checkpoint.clean_interval.is_zero() {
        errors.push("checkpoint.clean_interval must be positive".to_string());
    }
    if config.checkpoint.max_clean_items == 0 {
        errors.push("checkpoint.max_clean_items must be at least 1".to_string());
    }
    if config.runtime.stop_timeout.is_zero() {
        errors.push("runtime.stop_timeout must be positive".to_string());
    }
    if !config.runtime.default_flusher.starts_with("flusher_") {
        errors.push(format!(
            "runtime.default_flusher '{}' is not a flusher type",
            config.runtime.default_flusher
        ));
    }
    if config.global.default_log_queue_size == 0 {
        errors.push("global.DefaultLogQueueSize must be at least 1".to_string());
    }
    if config.global.default_log_group_queue_size == 0 {
        errors.push("global.DefaultLogGroupQueueSize must be at least 1".to_string());
    }
    if let Some(control) = &config.control {
        if control.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "control.listen '{}' is not a socket address",
                control.listen
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.checkpoint.file, "checkpoint");
        assert_eq!(config.checkpoint.clean_interval, Duration::from_secs(600));
        assert!(config.control.is_none());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
checkpoint:
  dir: /var/lib/logferry
  file: cp
pipelines:
  dir: /etc/logferry/pipelines
global:
  FlushIntervalMs: 100
  Tags:
    dc: east
control:
  listen: 127.0.0.1:7390
runtime:
  stop_timeout: 10s
  self_statistics: true
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.checkpoint.file, "cp");
        assert_eq!(config.global.flush_interval_ms, 100);
        assert_eq!(config.global.tags.get("dc").map(String::as_str), Some("east"));
        assert_eq!(config.runtime.stop_timeout, Duration::from_secs(10));
        assert!(config.runtime.self_statistics);
    }

    #[test]
    fn test_validation_collects_every_error() {
        let yaml = "checkpoint:\n  max_clean_items: 0\nruntime:\n  default_flusher: stdout\ncontrol:\n  listen: nowhere\n";
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unexpanded_env_var_is_rejected() {
        let yaml = "checkpoint:\n  dir: $env{LOGFERRY_SURELY_UNSET_VAR}\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Validation(_))));
    }
}
