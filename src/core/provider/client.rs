//! HTTP client for creating provider calls.
//!
//! `POST {base_url}/call` with bearer auth and
//! `{"assistantId": ..., "transport": {"provider": "vapi.websocket"}}`.
//! Only `201 Created` counts as success; the response carries the call `id`
//! and `transport.websocketCallUrl`.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::base::{ProviderCall, ProviderError, ProviderResult};

pub const DEFAULT_BASE_URL: &str = "https://api.vapi.ai";
pub const DEFAULT_TRANSPORT: &str = "vapi.websocket";

#[derive(Debug, Clone)]
pub struct CallClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    /// Value of `transport.provider` in the request body.
    pub transport: String,
    pub timeout: Duration,
}

impl Default for CallClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            assistant_id: None,
            transport: DEFAULT_TRANSPORT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct CreateCallRequest<'a> {
    #[serde(rename = "assistantId")]
    assistant_id: &'a str,
    transport: TransportRequest<'a>,
}

#[derive(Serialize)]
struct TransportRequest<'a> {
    provider: &'a str,
}

#[derive(Deserialize)]
struct CreateCallResponse {
    id: Option<String>,
    transport: Option<TransportResponse>,
}

#[derive(Deserialize)]
struct TransportResponse {
    #[serde(rename = "websocketCallUrl")]
    websocket_call_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CallClient {
    http: reqwest::Client,
    config: CallClientConfig,
}

impl CallClient {
    pub fn new(config: CallClientConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &CallClientConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/call", self.config.base_url.trim_end_matches('/'))
    }

    /// Request a new call with the configured assistant. Not retried.
    pub async fn create_call(&self) -> ProviderResult<ProviderCall> {
        self.create_call_for(None).await
    }

    /// Request a new call, optionally for another assistant than the
    /// configured one.
    pub async fn create_call_for(&self, assistant_id: Option<&str>) -> ProviderResult<ProviderCall> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            ProviderError::InvalidConfiguration("VAPI_API_KEY is not configured".to_string())
        })?;
        let assistant_id = assistant_id
            .filter(|id| !id.is_empty())
            .or(self.config.assistant_id.as_deref())
            .ok_or_else(|| {
                ProviderError::InvalidConfiguration("VAPI_ASSISTANT_ID is not configured".to_string())
            })?;

        let body = CreateCallRequest {
            assistant_id,
            transport: TransportRequest {
                provider: &self.config.transport,
            },
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("call request after {:?}", self.config.timeout))
                } else {
                    ProviderError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Provider rejected call request");
            return Err(ProviderError::CallRejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("missing call id".to_string()))?;
        let websocket_call_url = parsed
            .transport
            .and_then(|t| t.websocket_call_url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing transport.websocketCallUrl".to_string())
            })?;

        info!(call_id = %id, "Created provider call");
        Ok(ProviderCall {
            id,
            websocket_call_url,
        })
    }
}
