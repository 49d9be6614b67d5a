//! `flusher_http`: POSTs batches as JSON to a remote endpoint.

use super::basic_auth::BasicAuth;
use crate::model::{Batch, GroupEvents};
use crate::plugin::{
    decode_detail, ContractVersion, FlusherV1, FlusherV2, PluginContext, PluginError,
    PluginInstance, PluginRegistry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const FLUSHER_HTTP: &str = "flusher_http";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HttpDetail {
    #[serde(rename = "RemoteURL")]
    pub remote_url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// Extra attempts after the first failed one.
    pub retry: u32,
    /// `name/id` of an `ext_basic_auth` extension of the same pipeline.
    pub authenticator: Option<String>,
}

impl Default for HttpDetail {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            timeout_ms: 60_000,
            retry: 3,
            authenticator: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Payload<'a, T: Serialize> {
    config_name: &'a str,
    data: &'a [T],
}

pub struct HttpFlusher {
    detail: HttpDetail,
    config_name: String,
    client: Option<reqwest::Client>,
    auth: Option<Arc<dyn crate::plugin::Extension>>,
    urgent: bool,
}

impl HttpFlusher {
    pub fn new(detail: HttpDetail) -> Self {
        Self {
            detail,
            config_name: String::new(),
            client: None,
            auth: None,
            urgent: false,
        }
    }

    fn setup(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        if self.detail.remote_url.is_empty() {
            return Err(PluginError::init_failed(FLUSHER_HTTP, "RemoteURL must not be empty"));
        }
        if let Some(name) = &self.detail.authenticator {
            let ext = ctx.get_extension(name).ok_or_else(|| {
                PluginError::init_failed(FLUSHER_HTTP, format!("extension {} not found", name))
            })?;
            if ext.as_any().downcast_ref::<BasicAuth>().is_none() {
                return Err(PluginError::init_failed(
                    FLUSHER_HTTP,
                    format!("extension {} is not an authenticator", name),
                ));
            }
            self.auth = Some(ext);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.detail.timeout_ms))
            .build()
            .map_err(|e| PluginError::init_failed(FLUSHER_HTTP, e))?;
        self.client = Some(client);
        self.config_name = ctx.config_name().to_string();
        Ok(())
    }

    async fn post<T: Serialize + Sync>(&self, data: &[T]) -> Result<(), PluginError> {
        let Some(client) = &self.client else {
            return Err(PluginError::Other("http flusher used before init".into()));
        };
        let payload = Payload {
            config_name: &self.config_name,
            data,
        };
        // An exiting process gets one attempt.
        let attempts = if self.urgent { 1 } else { self.detail.retry + 1 };
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let mut request = client.post(&self.detail.remote_url).query(&self.detail.query);
            for (key, value) in &self.detail.headers {
                request = request.header(key, value);
            }
            if let Some(auth) = self
                .auth
                .as_ref()
                .and_then(|ext| ext.as_any().downcast_ref::<BasicAuth>())
            {
                request = auth.apply(request);
            }
            match request.json(&payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = format!("remote returned status {}", response.status().as_u16());
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(url = %self.detail.remote_url, attempt, error = %last_error, "http flush failed");
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(1 << attempt.min(5))).await;
            }
        }
        Err(PluginError::Other(last_error))
    }
}

#[async_trait]
impl FlusherV1 for HttpFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.setup(ctx)
    }

    fn description(&self) -> String {
        format!("http flusher to {}", self.detail.remote_url)
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        self.client.is_some()
    }

    async fn flush(
        &mut self,
        _project: &str,
        _logstore: &str,
        _config_name: &str,
        batches: &[Batch],
    ) -> Result<(), PluginError> {
        self.post(batches).await
    }

    fn set_urgent(&mut self, exiting: bool) {
        self.urgent = exiting;
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl FlusherV2 for HttpFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.setup(ctx)
    }

    fn description(&self) -> String {
        format!("http flusher v2 to {}", self.detail.remote_url)
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        self.client.is_some()
    }

    async fn export(&mut self, groups: &[GroupEvents]) -> Result<(), PluginError> {
        self.post(groups).await
    }

    fn set_urgent(&mut self, exiting: bool) {
        self.urgent = exiting;
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        self.client = None;
        Ok(())
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(FLUSHER_HTTP, |version, detail| {
        let detail: HttpDetail = decode_detail(FLUSHER_HTTP, detail)?;
        Ok(match version {
            ContractVersion::V1 => PluginInstance::FlusherV1(Box::new(HttpFlusher::new(detail))),
            ContractVersion::V2 => PluginInstance::FlusherV2(Box::new(HttpFlusher::new(detail))),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::plugins::basic_auth::BasicAuthDetail;

    fn ctx() -> PluginContext {
        PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::new()))
    }

    #[test]
    fn test_detail_wire_names() {
        let detail: HttpDetail = serde_json::from_value(serde_json::json!({
            "RemoteURL": "http://127.0.0.1:9/ingest",
            "Headers": {"X-Tenant": "a"},
            "Authenticator": "ext_basic_auth/1"
        }))
        .unwrap();
        assert_eq!(detail.remote_url, "http://127.0.0.1:9/ingest");
        assert_eq!(detail.timeout_ms, 60_000);
        assert_eq!(detail.authenticator.as_deref(), Some("ext_basic_auth/1"));
    }

    #[test]
    fn test_init_requires_url_and_extension() {
        let mut flusher = HttpFlusher::new(HttpDetail::default());
        assert!(FlusherV1::init(&mut flusher, &ctx()).is_err());

        let mut flusher = HttpFlusher::new(HttpDetail {
            remote_url: "http://127.0.0.1:9".into(),
            authenticator: Some("ext_basic_auth/1".into()),
            ..HttpDetail::default()
        });
        let ctx = ctx();
        assert!(FlusherV1::init(&mut flusher, &ctx).is_err());

        let auth = BasicAuth::new(BasicAuthDetail {
            username: "agent".into(),
            password: "secret".into(),
        });
        ctx.add_extension("ext_basic_auth/1", Arc::new(auth));
        FlusherV1::init(&mut flusher, &ctx).unwrap();
        assert!(FlusherV1::is_ready(&flusher, "p", "l", 0));
    }
}
