//! OpenAI Responses API client running every prompt as a background task.
//!
//! `submit` creates a response with `background: true` and a strict
//! `json_schema` text format; `retrieve` reads it back by id. A process-wide
//! instance is available through [`shared_provider`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use lexmill_core::{
    Error, LlmProvider, ProviderErrorKind, ProviderTask, ProviderTaskStatus, Result,
    SubmitRequest, TaskHandle, TokenUsage,
};

use crate::config::ProviderConfig;
use crate::error::{from_reqwest, from_response};

/// Maximum metadata pairs the API accepts on one request.
const MAX_METADATA_PAIRS: usize = 16;

/// Maximum characters of one metadata value.
const MAX_METADATA_VALUE_CHARS: usize = 512;

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateResponseBody<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    input: &'a str,
    background: bool,
    store: bool,
    text: JsonValue,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResponseObject {
    id: String,
    status: ProviderTaskStatus,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    error: Option<ResponseError>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl ResponseObject {
    /// Concatenated `output_text` parts of all message items.
    fn output_text(&self) -> Option<String> {
        let text: String = self
            .output
            .iter()
            .filter(|item| item.item_type == "message")
            .flat_map(|item| item.content.iter())
            .filter(|c| c.content_type == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn refusal(&self) -> Option<&str> {
        self.output
            .iter()
            .flat_map(|item| item.content.iter())
            .find_map(|c| c.refusal.as_deref())
    }

    fn into_task(self) -> ProviderTask {
        let output = self.output_text();
        let error = match self.status {
            ProviderTaskStatus::Failed => Some(match &self.error {
                Some(e) => match &e.code {
                    Some(code) => format!("{}: {}", code, e.message),
                    None => e.message.clone(),
                },
                None => "Provider reported failure without details".to_string(),
            }),
            ProviderTaskStatus::Incomplete => Some(format!(
                "Incomplete response: {}",
                self.incomplete_details
                    .as_ref()
                    .and_then(|d| d.reason.as_deref())
                    .unwrap_or("unknown reason")
            )),
            ProviderTaskStatus::Completed if output.is_none() => {
                self.refusal().map(|r| format!("Refused: {}", r))
            }
            _ => None,
        };
        ProviderTask {
            id: self.id,
            status: self.status,
            output,
            error,
            usage: self.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        }
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Background-mode client for OpenAI-compatible Responses APIs.
pub struct OpenAIProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAIProvider {
    /// Build a provider; fails with `Unavailable` when no API key is configured.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(Error::provider(
                ProviderErrorKind::Unavailable,
                "OPENAI_API_KEY is not set",
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            component = "provider",
            base_url = %config.base_url,
            model = %config.default_model,
            "Initializing OpenAI provider"
        );
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ProviderConfig::from_env())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let mut req = req;
        if let Some(ref key) = self.config.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref org) = self.config.organization {
            req = req.header("OpenAI-Organization", org);
        }
        req
    }

    async fn send_for_response(&self, req: RequestBuilder) -> Result<ResponseObject> {
        let response = self.authorize(req).send().await.map_err(from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(from_response(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            Error::provider(
                ProviderErrorKind::Unknown,
                format!("Unexpected response body: {}", e),
            )
        })
    }
}

/// Trim metadata to what the API accepts.
fn clamp_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .take(MAX_METADATA_PAIRS)
        .map(|(k, v)| (k.clone(), v.chars().take(MAX_METADATA_VALUE_CHARS).collect()))
        .collect()
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn submit(&self, request: &SubmitRequest) -> Result<TaskHandle> {
        let body = CreateResponseBody {
            model: &request.model,
            instructions: request.system.as_deref(),
            input: &request.prompt,
            background: true,
            store: true,
            text: json!({
                "format": {
                    "type": "json_schema",
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                }
            }),
            metadata: clamp_metadata(&request.metadata),
        };

        let created = self
            .send_for_response(self.client.post(self.url("/responses")).json(&body))
            .await?;
        debug!(
            subsystem = "inference",
            component = "provider",
            op = "submit",
            task_id = %created.id,
            model = %request.model,
            "Background response created"
        );
        Ok(TaskHandle(created.id))
    }

    async fn retrieve(&self, handle: &TaskHandle) -> Result<ProviderTask> {
        let path = format!("/responses/{}", handle.as_str());
        let response = self.send_for_response(self.client.get(self.url(&path))).await?;
        Ok(response.into_task())
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let path = format!("/responses/{}/cancel", handle.as_str());
        match self.send_for_response(self.client.post(self.url(&path))).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    subsystem = "inference",
                    component = "provider",
                    op = "cancel",
                    task_id = %handle,
                    error = %e,
                    "Provider cancel failed"
                );
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// =============================================================================
// SHARED INSTANCE
// =============================================================================

static SHARED_PROVIDER: OnceCell<Option<Arc<dyn LlmProvider>>> = OnceCell::new();

/// Process-wide provider built from the environment on first use.
///
/// Returns `None` (and logs once) when the provider cannot be configured, so
/// callers degrade the feature instead of failing at startup.
pub fn shared_provider() -> Option<Arc<dyn LlmProvider>> {
    SHARED_PROVIDER
        .get_or_init(|| match OpenAIProvider::from_env() {
            Ok(p) => Some(Arc::new(p) as Arc<dyn LlmProvider>),
            Err(e) => {
                warn!(
                    subsystem = "inference",
                    component = "provider",
                    error = %e,
                    "LLM provider unavailable"
                );
                None
            }
        })
        .clone()
}
