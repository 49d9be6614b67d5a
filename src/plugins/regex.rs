use crate::model::{Record, BODY_KEY};
use crate::plugin::{
    decode_detail, PluginContext, PluginError, PluginInstance, PluginRegistry, ProcessorV1,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const PROCESSOR_REGEX: &str = "processor_regex";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RegexDetail {
    pub source_key: String,
    pub regex: String,
    /// Keys written on a match, in addition to the named captures.
    pub set: BTreeMap<String, String>,
    /// Keep the source key after a successful match.
    pub keep_source: bool,
}

impl Default for RegexDetail {
    fn default() -> Self {
        Self {
            source_key: BODY_KEY.to_string(),
            regex: String::new(),
            set: BTreeMap::new(),
            keep_source: true,
        }
    }
}

/// Matches one key against a pattern. On a match, named capture groups
/// become keys and `Set` is applied; records that do not match pass through
/// unchanged.
pub struct RegexProcessor {
    detail: RegexDetail,
    regex: Option<Regex>,
}

impl RegexProcessor {
    pub fn new(detail: RegexDetail) -> Self {
        Self {
            detail,
            regex: None,
        }
    }

    fn apply(&self, regex: &Regex, record: &mut Record) {
        let Some(source) = record.get(&self.detail.source_key) else {
            return;
        };
        let Some(captures) = regex.captures(source) else {
            return;
        };
        let extracted: Vec<(String, String)> = regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        for (key, value) in extracted {
            record.set(key, value);
        }
        for (key, value) in &self.detail.set {
            record.set(key.clone(), value.clone());
        }
        if !self.detail.keep_source {
            record.remove(&self.detail.source_key);
        }
    }
}

impl ProcessorV1 for RegexProcessor {
    fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        if self.detail.regex.is_empty() {
            return Err(PluginError::init_failed(PROCESSOR_REGEX, "Regex must not be empty"));
        }
        let regex = Regex::new(&self.detail.regex)
            .map_err(|e| PluginError::init_failed(PROCESSOR_REGEX, e))?;
        self.regex = Some(regex);
        Ok(())
    }

    fn description(&self) -> String {
        format!("regex processor on {}", self.detail.source_key)
    }

    fn process_logs(&mut self, mut logs: Vec<Record>) -> Vec<Record> {
        if let Some(regex) = &self.regex {
            for record in &mut logs {
                self.apply(regex, record);
            }
        }
        logs
    }
}

pub fn register(registry: &mut PluginRegistry) {
    // Only the record contract exists; v2 pipelines get `Unsupported`.
    registry.register(PROCESSOR_REGEX, |_, detail| {
        let detail: RegexDetail = decode_detail(PROCESSOR_REGEX, detail)?;
        Ok(PluginInstance::ProcessorV1(Box::new(RegexProcessor::new(detail))))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use std::sync::Arc;

    fn processor(detail: serde_json::Value) -> RegexProcessor {
        let detail: RegexDetail = serde_json::from_value(detail).unwrap();
        let mut p = RegexProcessor::new(detail);
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::new()));
        p.init(&ctx).unwrap();
        p
    }

    #[test]
    fn test_set_on_match_only() {
        let mut p = processor(serde_json::json!({"Regex": "hello", "Set": {"level": "INFO"}}));
        let logs = vec![
            [("content", "hello world")].into_iter().collect::<Record>(),
            [("content", "bye")].into_iter().collect::<Record>(),
        ];
        let out = p.process_logs(logs);
        assert_eq!(out[0].get("level"), Some("INFO"));
        assert_eq!(out[1].get("level"), None);
    }

    #[test]
    fn test_named_captures_and_drop_source() {
        let mut p = processor(serde_json::json!({
            "SourceKey": "line",
            "Regex": r"^(?P<method>\w+) (?P<path>\S+)",
            "KeepSource": false
        }));
        let out = p.process_logs(vec![[("line", "GET /index.html HTTP/1.1")]
            .into_iter()
            .collect()]);
        assert_eq!(out[0].get("method"), Some("GET"));
        assert_eq!(out[0].get("path"), Some("/index.html"));
        assert!(!out[0].contains_key("line"));
    }

    #[test]
    fn test_invalid_regex_fails_init() {
        let detail: RegexDetail =
            serde_json::from_value(serde_json::json!({"Regex": "(unclosed"})).unwrap();
        let mut p = RegexProcessor::new(detail);
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::new()));
        assert!(matches!(p.init(&ctx), Err(PluginError::InitFailed { .. })));
    }
}
