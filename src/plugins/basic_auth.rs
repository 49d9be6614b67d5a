use crate::plugin::{
    decode_detail, Extension, PluginContext, PluginError, PluginInstance, PluginRegistry,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;

pub const EXT_BASIC_AUTH: &str = "ext_basic_auth";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct BasicAuthDetail {
    pub username: String,
    pub password: String,
}

/// Client authenticator shared by flushers of one pipeline. Flushers look it
/// up with [`PluginContext::get_extension`] and downcast via `as_any`.
#[derive(Debug)]
pub struct BasicAuth {
    detail: BasicAuthDetail,
}

impl BasicAuth {
    pub fn new(detail: BasicAuthDetail) -> Self {
        Self { detail }
    }

    pub fn username(&self) -> &str {
        &self.detail.username
    }

    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.detail.username, Some(&self.detail.password))
    }
}

#[async_trait]
impl Extension for BasicAuth {
    fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        if self.detail.username.is_empty() {
            return Err(PluginError::init_failed(EXT_BASIC_AUTH, "Username must not be empty"));
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("basic auth for {}", self.detail.username)
    }

    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(EXT_BASIC_AUTH, |_, detail| {
        let detail: BasicAuthDetail = decode_detail(EXT_BASIC_AUTH, detail)?;
        Ok(PluginInstance::Extension(Box::new(BasicAuth::new(detail))))
    });
}
