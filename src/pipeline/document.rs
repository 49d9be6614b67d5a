use super::PipelineError;
use crate::config::detail_hash;
use crate::plugin::meta::plugin_type;
use serde::Deserialize;
use serde_json::Value;

/// Input type whose pipelines may be upgraded to always-online.
pub const DOCKER_STDOUT_INPUT: &str = "service_docker_stdout";

/// One `{ "type": ..., "detail": ... }` entry of a plugin list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginEntry {
    #[serde(rename = "type")]
    pub type_with_id: String,
    #[serde(default)]
    pub detail: Option<Value>,
}

impl PluginEntry {
    pub fn plugin_type(&self) -> &str {
        plugin_type(&self.type_with_id)
    }
}

/// How a document without inputs is fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixProcessMode {
    /// Records come from the host file reader; payloads are large.
    File,
    Observer,
}

/// A parsed pipeline document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineDocument {
    #[serde(default)]
    pub global: Option<Value>,
    #[serde(default)]
    pub inputs: Vec<PluginEntry>,
    #[serde(default)]
    pub processors: Vec<PluginEntry>,
    #[serde(default)]
    pub aggregators: Vec<PluginEntry>,
    #[serde(default)]
    pub flushers: Vec<PluginEntry>,
    #[serde(default)]
    pub extensions: Vec<PluginEntry>,
    #[serde(default)]
    pub mix_process_mode: Option<String>,
}

impl PipelineDocument {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(PipelineError::ConfigInvalid(
                "pipeline document must be a JSON object".to_string(),
            ));
        }
        let document: PipelineDocument = serde_json::from_value(value)?;
        Ok(document)
    }

    /// `None` for documents with inputs; documents without inputs default
    /// to file mode unless they ask for observer mode.
    pub fn mix_mode(&self) -> Option<MixProcessMode> {
        if !self.inputs.is_empty() {
            return None;
        }
        match self.mix_process_mode.as_deref() {
            Some(mode) if mode.eq_ignore_ascii_case("observer") => Some(MixProcessMode::Observer),
            _ => Some(MixProcessMode::File),
        }
    }

    pub fn has_docker_stdout_input(&self) -> bool {
        self.inputs
            .iter()
            .any(|entry| entry.plugin_type() == DOCKER_STDOUT_INPUT)
    }
}

/// A pipeline document plus the identity it is loaded under.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project: String,
    pub logstore: String,
    pub name: String,
    pub detail_hash: String,
    pub document: PipelineDocument,
}

impl PipelineConfig {
    pub fn parse(
        project: impl Into<String>,
        logstore: impl Into<String>,
        name: impl Into<String>,
        text: &str,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "configuration name is empty".to_string(),
            ));
        }
        Ok(Self {
            document: PipelineDocument::parse(text)?,
            detail_hash: detail_hash(text),
            project: project.into(),
            logstore: logstore.into(),
            name,
        })
    }

    /// Stable 63-bit key derived from the detail hash, passed to `is_ready`.
    pub fn logstore_key(&self) -> i64 {
        let prefix = self.detail_hash.get(..16).unwrap_or("0");
        u64::from_str_radix(prefix, 16)
            .map(|key| (key >> 1) as i64)
            .unwrap_or(0)
    }
}
