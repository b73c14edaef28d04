//! Inference backends and the local-first router.
//!
//! Backends implement [`InferenceBackend`]: a prompt in, generated text out.
//! Two HTTP backends are provided:
//! - **[`OllamaBackend`]**: `POST /api/generate` on a local Ollama server.
//! - **[`OpenAiBackend`]**: `POST /v1/chat/completions` on the OpenAI API or
//!   any compatible server.
//!
//! [`InferenceRouter`] picks the backend for each request:
//!
//! | Preference | Order of attempts                                    |
//! |------------|------------------------------------------------------|
//! | `local`    | local, then remote once if local fails               |
//! | `cloud`    | remote only                                          |
//! | `auto`     | like `local`; advisory queries go straight to remote |
//! |            | when `remote_for_advisory` is set                    |
//!
//! Fallback is one-way: a failing remote backend is never retried against
//! the local one.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{BackendConfig, InferenceConfig, ProviderPreference};
use crate::error::{Result, SearchError};
use crate::models::QueryType;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// `provider:model`, recorded on every answer this backend produces.
    fn id(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Text produced by the router plus the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub backend: String,
}

/// Build the backend described by one `[inference.local]` or
/// `[inference.remote]` table.
pub fn create_backend(config: &BackendConfig, timeout_secs: u64) -> Result<Arc<dyn InferenceBackend>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaBackend::new(config, timeout_secs)?)),
        "openai" => Ok(Arc::new(OpenAiBackend::new(config, timeout_secs)?)),
        other => Err(SearchError::Config(format!(
            "unknown inference provider: {}",
            other
        ))),
    }
}

async fn post_json(
    client: &reqwest::Client,
    backend: &str,
    timeout_secs: u64,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = match tokio::time::timeout(Duration::from_secs(timeout_secs), request.send()).await
    {
        Err(_) => return Err(SearchError::inference_timeout(backend, timeout_secs)),
        Ok(Err(e)) if e.is_timeout() => {
            return Err(SearchError::inference_timeout(backend, timeout_secs))
        }
        Ok(Err(e)) => {
            return Err(SearchError::inference(
                backend,
                format!("connection error at {}: {}", url, e),
            ))
        }
        Ok(Ok(r)) => r,
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SearchError::inference(
            backend,
            format!("API error {}: {}", status, text),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| SearchError::inference(backend, format!("invalid response body: {}", e)))
}

fn http_client(backend: &str, timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SearchError::inference(backend, e.to_string()))
}

// ============ Ollama ============

pub struct OllamaBackend {
    id: String,
    client: reqwest::Client,
    model: String,
    url: String,
    timeout_secs: u64,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig, timeout_secs: u64) -> Result<Self> {
        let id = format!("ollama:{}", config.model);
        Ok(Self {
            client: http_client(&id, timeout_secs)?,
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            timeout_secs,
            id,
        })
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let json = post_json(
            &self.client,
            &self.id,
            self.timeout_secs,
            &format!("{}/api/generate", self.url.trim_end_matches('/')),
            None,
            &body,
        )
        .await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| SearchError::inference(&self.id, "response missing 'response' field"))
    }
}

// ============ OpenAI ============

/// Chat completions backend. `OPENAI_API_KEY` is required for the default
/// endpoint and optional for a custom `url`.
pub struct OpenAiBackend {
    id: String,
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig, timeout_secs: u64) -> Result<Self> {
        let id = format!("openai:{}", config.model);
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            return Err(SearchError::Config(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(&id, timeout_secs)?,
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            timeout_secs,
            id,
        })
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.2,
        });
        let json = post_json(
            &self.client,
            &self.id,
            self.timeout_secs,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            self.api_key.as_deref(),
            &body,
        )
        .await?;
        parse_chat_response(&self.id, &json)
    }
}

fn parse_chat_response(backend: &str, json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| SearchError::inference(backend, "response missing choices[0].message.content"))
}

// ============ Router ============

pub struct InferenceRouter {
    local: Option<Arc<dyn InferenceBackend>>,
    remote: Option<Arc<dyn InferenceBackend>>,
    preference: ProviderPreference,
    remote_for_advisory: bool,
    timeout: Duration,
}

impl InferenceRouter {
    pub fn new(
        local: Option<Arc<dyn InferenceBackend>>,
        remote: Option<Arc<dyn InferenceBackend>>,
        preference: ProviderPreference,
    ) -> Self {
        Self {
            local,
            remote,
            preference,
            remote_for_advisory: false,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let local = config
            .local
            .as_ref()
            .map(|b| create_backend(b, config.timeout_secs))
            .transpose()?;
        let remote = config
            .remote
            .as_ref()
            .map(|b| create_backend(b, config.timeout_secs))
            .transpose()?;
        Ok(Self::new(local, remote, config.preference)
            .with_remote_for_advisory(config.remote_for_advisory)
            .with_timeout(Duration::from_secs(config.timeout_secs)))
    }

    pub fn with_remote_for_advisory(mut self, enabled: bool) -> Self {
        self.remote_for_advisory = enabled;
        self
    }

    /// Upper bound for one backend call, on top of the backend's own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backends to try, in order, for a query of `query_type`.
    fn plan(&self, query_type: QueryType) -> Vec<Arc<dyn InferenceBackend>> {
        let local_first = || -> Vec<Arc<dyn InferenceBackend>> {
            self.local.iter().chain(self.remote.iter()).cloned().collect()
        };
        match self.preference {
            ProviderPreference::Cloud => self.remote.iter().cloned().collect(),
            ProviderPreference::Auto
                if query_type == QueryType::Advisory && self.remote_for_advisory =>
            {
                match &self.remote {
                    Some(remote) => vec![Arc::clone(remote)],
                    None => local_first(),
                }
            }
            ProviderPreference::Local | ProviderPreference::Auto => local_first(),
        }
    }

    async fn call(&self, backend: &dyn InferenceBackend, prompt: &str) -> Result<String> {
        match tokio::time::timeout(self.timeout, backend.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(SearchError::inference_timeout(
                backend.id(),
                self.timeout.as_secs(),
            )),
        }
    }

    /// Generate text for `prompt`, falling back from local to remote at most
    /// once.
    pub async fn generate(&self, prompt: &str, query_type: QueryType) -> Result<Generation> {
        let plan = self.plan(query_type);
        if plan.is_empty() {
            return Err(SearchError::inference(
                "none",
                format!(
                    "no inference backend configured for preference {:?}",
                    self.preference
                ),
            ));
        }

        let mut last_err = None;
        for backend in plan {
            debug!(backend = backend.id(), "inference request");
            match self.call(backend.as_ref(), prompt).await {
                Ok(text) => {
                    return Ok(Generation {
                        text,
                        backend: backend.id().to_string(),
                    })
                }
                Err(e) => {
                    warn!(backend = backend.id(), error = %e, "inference backend failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SearchError::inference("none", "no backend attempted")))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend returning a fixed reply, or failing, counting its calls.
    pub struct StaticBackend {
        pub id: String,
        pub reply: Option<String>,
        pub calls: AtomicUsize,
    }

    impl StaticBackend {
        pub fn ok(id: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn down(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceBackend for StaticBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .ok_or_else(|| SearchError::inference(&self.id, "connection refused"))
        }
    }
}
