//! Concrete generation backends
//!
//! `HttpGenerationBackend` speaks the OpenAI-compatible chat-completions
//! protocol; `CommandGenerationBackend` pipes the prompt into a local CLI.
//! Both serve code and test generation, which differ only in their prompts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capability::{CallLimits, CapabilityError, CodeGenerator, GenerationRequest, TestGenerator};
use crate::process::{CommandError, CommandExecutor, CommandSpec};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpGenerationBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    limits: CallLimits,
}

impl HttpGenerationBackend {
    /// `base_url` is the API root, e.g. `https://api.example.com/v1`.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        limits: CallLimits,
    ) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rec-deploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CapabilityError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            limits,
        })
    }

    async fn complete(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.limits
            .guard(request, cancel, async {
                let mut messages = Vec::with_capacity(2);
                if !request.system.is_empty() {
                    messages.push(ChatMessage {
                        role: "system",
                        content: &request.system,
                    });
                }
                messages.push(ChatMessage {
                    role: "user",
                    content: &request.prompt,
                });
                let body = ChatRequest {
                    model: &self.model,
                    temperature: request.temperature,
                    max_tokens: request.max_output_tokens,
                    messages,
                };

                let mut builder = self.client.post(&self.endpoint).json(&body);
                if let Some(key) = &self.api_key {
                    builder = builder.bearer_auth(key);
                }

                let response = builder
                    .send()
                    .await
                    .map_err(|e| CapabilityError::Backend(format!("request failed: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    let snippet: String = text.chars().take(300).collect();
                    warn!(status = %status, "Generation endpoint returned an error");
                    return Err(CapabilityError::Backend(format!("HTTP {status}: {snippet}")));
                }

                let parsed: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| CapabilityError::Backend(format!("invalid response body: {e}")))?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                if content.trim().is_empty() {
                    return Err(CapabilityError::EmptyResponse);
                }
                debug!(response_chars = content.len(), "Generation call completed");
                Ok(content)
            })
            .await
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerationBackend {
    async fn generate_code(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.complete(request, cancel).await
    }
}

#[async_trait]
impl TestGenerator for HttpGenerationBackend {
    async fn generate_tests(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.complete(request, cancel).await
    }
}

/// Runs `program args...` with the system and user prompt on stdin and reads
/// the generated source from stdout. Sampling temperature is passed through
/// the `REC_DEPLOY_TEMPERATURE` environment variable.
pub struct CommandGenerationBackend {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    args: Vec<String>,
    limits: CallLimits,
}

impl CommandGenerationBackend {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        command: &[String],
        limits: CallLimits,
    ) -> Result<Self, CapabilityError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CapabilityError::Backend("generation command is empty".into()))?;
        Ok(Self {
            executor,
            program: program.clone(),
            args: args.to_vec(),
            limits,
        })
    }

    async fn complete(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        let input = if request.system.is_empty() {
            request.prompt.clone()
        } else {
            format!("{}\n\n{}", request.system, request.prompt)
        };
        // the executor enforces the deadline itself; the guard's deadline is
        // a backstop
        let spec = CommandSpec::new(&self.program, self.limits.timeout)
            .args(self.args.iter().cloned())
            .stdin(input)
            .env("REC_DEPLOY_TEMPERATURE", request.temperature.to_string())
            .env("REC_DEPLOY_MAX_TOKENS", request.max_output_tokens.to_string());

        self.limits
            .guard(request, cancel, async {
                let output = self.executor.execute(&spec, cancel).await.map_err(|e| match e {
                    CommandError::Timeout { timeout_ms } => {
                        CapabilityError::Timeout(std::time::Duration::from_millis(timeout_ms))
                    }
                    CommandError::Cancelled => CapabilityError::Cancelled,
                    other => CapabilityError::Backend(other.to_string()),
                })?;
                if !output.success() {
                    let snippet: String = output.stderr.chars().take(300).collect();
                    return Err(CapabilityError::Backend(format!(
                        "{} exited with {}: {}",
                        self.program, output.status_code, snippet
                    )));
                }
                if output.stdout.trim().is_empty() {
                    return Err(CapabilityError::EmptyResponse);
                }
                Ok(output.stdout)
            })
            .await
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerationBackend {
    async fn generate_code(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.complete(request, cancel).await
    }
}

#[async_trait]
impl TestGenerator for CommandGenerationBackend {
    async fn generate_tests(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.complete(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessCommandExecutor;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limits() -> CallLimits {
        CallLimits::new(10_000, Duration::from_secs(5), 600)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: "You write Python.".into(),
            prompt: "Implement fg_pct".into(),
            temperature: 0.1,
            max_output_tokens: 512,
        }
    }

    #[tokio::test]
    async fn test_http_backend_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"model": "coder", "temperature": 0.1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "def fg_pct():\n    return 0.5\n"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(
            &format!("{}/v1", server.uri()),
            "coder",
            Some("secret".into()),
            limits(),
        )
        .unwrap();
        let code = backend
            .generate_code(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(code.contains("def fg_pct"));
    }

    #[tokio::test]
    async fn test_http_backend_maps_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(&server.uri(), "coder", None, limits()).unwrap();
        let err = backend
            .generate_tests(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CapabilityError::Backend(msg) => assert!(msg.contains("503") && msg.contains("overloaded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_backend_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(&server.uri(), "coder", None, limits()).unwrap();
        let err = backend
            .generate_code(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_command_backend_pipes_prompt() {
        let backend = CommandGenerationBackend::new(
            Arc::new(ProcessCommandExecutor),
            &["cat".to_string()],
            limits(),
        )
        .unwrap();
        let out = backend
            .generate_code(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.starts_with("You write Python."));
        assert!(out.contains("Implement fg_pct"));
    }

    #[tokio::test]
    async fn test_command_backend_failure() {
        let backend = CommandGenerationBackend::new(
            Arc::new(ProcessCommandExecutor),
            &["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()],
            limits(),
        )
        .unwrap();
        let err = backend
            .generate_code(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CapabilityError::Backend(msg) => assert!(msg.contains("exited with 3") && msg.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandGenerationBackend::new(Arc::new(ProcessCommandExecutor), &[], limits()).is_err());
    }
}
