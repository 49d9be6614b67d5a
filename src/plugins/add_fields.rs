use crate::model::{GroupEvents, Record};
use crate::plugin::{
    decode_detail, ContractVersion, PluginContext, PluginError, PluginInstance, PluginRegistry,
    ProcessorV1, ProcessorV2,
};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const PROCESSOR_ADD_FIELDS: &str = "processor_add_fields";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AddFieldsDetail {
    pub fields: BTreeMap<String, String>,
    /// Replace keys that are already present instead of leaving them alone.
    pub ignore_if_exist: bool,
}

pub struct AddFields {
    detail: AddFieldsDetail,
}

impl AddFields {
    pub fn new(detail: AddFieldsDetail) -> Self {
        Self { detail }
    }
}

impl ProcessorV1 for AddFields {
    fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        if self.detail.fields.is_empty() {
            return Err(PluginError::init_failed(PROCESSOR_ADD_FIELDS, "Fields must not be empty"));
        }
        Ok(())
    }

    fn description(&self) -> String {
        "add fields processor".to_string()
    }

    fn process_logs(&mut self, mut logs: Vec<Record>) -> Vec<Record> {
        for record in &mut logs {
            for (key, value) in &self.detail.fields {
                if self.detail.ignore_if_exist && record.contains_key(key) {
                    continue;
                }
                record.set(key.clone(), value.clone());
            }
        }
        logs
    }
}

impl ProcessorV2 for AddFields {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        ProcessorV1::init(self, ctx)
    }

    fn description(&self) -> String {
        "add fields processor v2".to_string()
    }

    fn process(&mut self, mut input: GroupEvents, output: &mut Vec<GroupEvents>) {
        for event in &mut input.events {
            for (key, value) in &self.detail.fields {
                if self.detail.ignore_if_exist && event.contents.contains_key(key) {
                    continue;
                }
                event.contents.insert(key.clone(), value.clone());
            }
        }
        output.push(input);
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(PROCESSOR_ADD_FIELDS, |version, detail| {
        let detail: AddFieldsDetail = decode_detail(PROCESSOR_ADD_FIELDS, detail)?;
        Ok(match version {
            ContractVersion::V1 => PluginInstance::ProcessorV1(Box::new(AddFields::new(detail))),
            ContractVersion::V2 => PluginInstance::ProcessorV2(Box::new(AddFields::new(detail))),
        })
    });
}
