//! HTTP tool invoker.
//!
//! Bridges the core to the external tool service that owns prompt
//! templates and provider routing. One endpoint, one JSON body per call;
//! images travel base64-encoded inside the body (the invoker's concern,
//! not the caller's).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::ports::{ToolCall, ToolError, ToolErrorKind, ToolInvoker, ToolResponse};
use crate::services::config::ToolsConfig;

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    text: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost: f64,
}

pub struct HttpToolInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpToolInvoker {
    pub fn new(config: &ToolsConfig) -> Result<Self, ToolError> {
        let base_url = config.api_url.clone().ok_or_else(|| ToolError {
            kind: ToolErrorKind::Provider,
            retryable: false,
            message: "tools api_url is not configured".into(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| ToolError::provider(e.to_string(), false))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn encode_image(image: &[u8]) -> String {
        BASE64_STANDARD.encode(image)
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::provider("cancelled", false));
        }
        debug!(tool = %call.tool, task_id = %call.task_id, "invoking tool");

        let body = serde_json::json!({
            "tool": call.tool.as_str(),
            "task_id": call.task_id,
            "text": call.text,
            "image": call.image.as_deref().map(Self::encode_image),
            "overrides": call.overrides,
        });

        let mut request = self
            .client
            .post(format!("{}/invoke", self.base_url))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let send = async {
            let response = request
                .send()
                .await
                .map_err(|e| ToolError::provider(e.to_string(), true))?;
            let status = response.status();
            if status.as_u16() == 429 {
                return Err(ToolError {
                    kind: ToolErrorKind::RateLimited,
                    retryable: true,
                    message: "tool service rate limited the call".into(),
                });
            }
            if status.is_server_error() {
                return Err(ToolError::provider(format!("tool service returned {status}"), true));
            }
            if !status.is_success() {
                return Err(ToolError::provider(format!("tool service returned {status}"), false));
            }
            let parsed: InvokeResponse = response.json().await.map_err(|e| ToolError {
                kind: ToolErrorKind::InvalidResponse,
                retryable: false,
                message: format!("bad tool response: {e}"),
            })?;
            Ok(ToolResponse {
                text: parsed.text,
                input_tokens: parsed.input_tokens,
                output_tokens: parsed.output_tokens,
                cost: parsed.cost,
            })
        };

        tokio::select! {
            result = send => result,
            _ = cancel.cancelled() => Err(ToolError::provider("cancelled", false)),
        }
    }
}
