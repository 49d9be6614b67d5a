use crate::model::{Batch, GroupEvents, META_SOURCE, META_TOPIC};
use crate::plugin::{
    decode_detail, ContractVersion, FlusherV1, FlusherV2, PluginContext, PluginError,
    PluginInstance, PluginRegistry,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Write;
use tracing::info;

pub const FLUSHER_STDOUT: &str = "flusher_stdout";

const TIME_KEY: &str = "__time__";
const TAG_KEY_PREFIX: &str = "__tag__:";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StdoutDetail {
    /// Write straight to stdout instead of through the log subscriber.
    pub only_stdout: bool,
    /// Include batch tags in every line.
    pub tags: bool,
}

/// Prints every record as one JSON object per line.
pub struct StdoutFlusher {
    detail: StdoutDetail,
    config_name: String,
}

impl StdoutFlusher {
    pub fn new(detail: StdoutDetail) -> Self {
        Self {
            detail,
            config_name: String::new(),
        }
    }

    fn batch_lines(&self, batch: &Batch) -> Vec<String> {
        batch
            .logs
            .iter()
            .map(|record| {
                let mut line = Map::new();
                line.insert(TIME_KEY.into(), Value::from(record.time));
                for content in &record.contents {
                    line.insert(content.key.clone(), Value::from(content.value.clone()));
                }
                if !batch.topic.is_empty() {
                    line.insert(META_TOPIC.into(), Value::from(batch.topic.clone()));
                }
                if !batch.source.is_empty() {
                    line.insert(META_SOURCE.into(), Value::from(batch.source.clone()));
                }
                if self.detail.tags {
                    for tag in &batch.tags {
                        line.insert(format!("{}{}", TAG_KEY_PREFIX, tag.key), Value::from(tag.value.clone()));
                    }
                }
                Value::Object(line).to_string()
            })
            .collect()
    }

    fn group_lines(&self, group: &GroupEvents) -> Vec<String> {
        group
            .events
            .iter()
            .map(|event| {
                let mut line = serde_json::json!({
                    "timestamp": event.timestamp,
                    "body": event.body,
                    "contents": event.contents,
                    "metadata": group.group.metadata,
                });
                if self.detail.tags {
                    line["tags"] = serde_json::json!(group.group.tags);
                }
                line.to_string()
            })
            .collect()
    }

    fn emit(&self, lines: Vec<String>) {
        if self.detail.only_stdout {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for line in lines {
                let _ = writeln!(out, "{}", line);
            }
        } else {
            for line in lines {
                info!(pipeline = %self.config_name, "{}", line);
            }
        }
    }
}

#[async_trait]
impl FlusherV1 for StdoutFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.config_name = ctx.config_name().to_string();
        Ok(())
    }

    fn description(&self) -> String {
        "stdout flusher".to_string()
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        true
    }

    async fn flush(
        &mut self,
        _project: &str,
        _logstore: &str,
        _config_name: &str,
        batches: &[Batch],
    ) -> Result<(), PluginError> {
        for batch in batches {
            self.emit(self.batch_lines(batch));
        }
        Ok(())
    }

    fn set_urgent(&mut self, _exiting: bool) {}

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl FlusherV2 for StdoutFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        FlusherV1::init(self, ctx)
    }

    fn description(&self) -> String {
        "stdout flusher v2".to_string()
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        true
    }

    async fn export(&mut self, groups: &[GroupEvents]) -> Result<(), PluginError> {
        for group in groups {
            self.emit(self.group_lines(group));
        }
        Ok(())
    }

    fn set_urgent(&mut self, _exiting: bool) {}

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(FLUSHER_STDOUT, |version, detail| {
        let detail: StdoutDetail = decode_detail(FLUSHER_STDOUT, detail)?;
        Ok(match version {
            ContractVersion::V1 => PluginInstance::FlusherV1(Box::new(StdoutFlusher::new(detail))),
            ContractVersion::V2 => PluginInstance::FlusherV2(Box::new(StdoutFlusher::new(detail))),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    #[test]
    fn test_batch_lines_are_json_objects() {
        let flusher = StdoutFlusher::new(StdoutDetail {
            only_stdout: true,
            tags: true,
        });
        let mut batch = Batch::new("topic-a");
        batch.source = "10.0.0.1".into();
        batch.add_tag("__hostname__", "node-1");
        let mut record: Record = [("content", "hello")].into_iter().collect();
        record.time = 42;
        batch.logs.push(record);

        let lines = flusher.batch_lines(&batch);
        assert_eq!(lines.len(), 1);
        let value: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["content"], "hello");
        assert_eq!(value["__time__"], 42);
        assert_eq!(value["__topic__"], "topic-a");
        assert_eq!(value["__source__"], "10.0.0.1");
        assert_eq!(value["__tag__:__hostname__"], "node-1");
    }
}
