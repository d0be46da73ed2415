//! Claude CLI subprocess provider.
//!
//! Invokes the `claude` binary with `--print --output-format json`,
//! resuming sessions with `--resume <session_id>`. The prompt is written
//! to stdin; stdout carries a JSON object whose `result` and
//! `session_id` fields feed the completion service. Stderr is captured
//! for diagnostics on failure.

use std::process::Stdio;

use ksi_core::SessionId;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{CompletionError, CompletionResult};
use crate::provider::{CompletionProvider, ProviderRequest, ProviderResponse};

/// Provider that shells out to the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliProvider {
    command: String,
}

impl ClaudeCliProvider {
    /// Create a provider invoking `command` (usually `"claude"`).
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn build_args(request: &ProviderRequest) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            request.model.clone(),
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(session) = &request.session_id {
            args.push("--resume".to_string());
            args.push(session.0.clone());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        args
    }

    fn parse_output(stdout: &str) -> CompletionResult<ProviderResponse> {
        // The CLI may print banner text before the JSON object.
        let json_start = stdout.find('{').ok_or_else(|| {
            CompletionError::MalformedOutput("no JSON object in provider output".to_string())
        })?;
        let parsed: Value = serde_json::from_str(&stdout[json_start..])
            .map_err(|e| CompletionError::MalformedOutput(e.to_string()))?;

        let result = parsed
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CompletionError::MalformedOutput("provider output missing 'result'".to_string())
            })?
            .to_string();
        let session_id = parsed
            .get("session_id")
            .or_else(|| parsed.get("sessionId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CompletionError::MalformedOutput(
                    "provider output missing 'session_id'".to_string(),
                )
            })?;

        Ok(ProviderResponse {
            result,
            session_id: SessionId::from(session_id),
            usage: parsed.get("usage").cloned().filter(|u| !u.is_null()),
            model: parsed
                .get("model")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        })
    }
}

#[async_trait::async_trait]
impl CompletionProvider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude_cli"
    }

    async fn complete(&self, request: &ProviderRequest) -> CompletionResult<ProviderResponse> {
        let executable = which::which(&self.command)
            .map_err(|_| CompletionError::ExecutableNotFound(self.command.clone()))?;

        let args = Self::build_args(request);
        debug!(command = %executable.display(), ?args, "invoking provider");

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            error!(status = ?output.status.code(), "provider exited non-zero");
            return Err(CompletionError::Provider {
                message: format!(
                    "provider exited with status {}",
                    output.status.code().unwrap_or(-1)
                ),
                stderr: if stderr.is_empty() { None } else { Some(stderr) },
            });
        }

        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_fresh_session() {
        let args = ClaudeCliProvider::build_args(&ProviderRequest {
            prompt: "hi".to_string(),
            model: "sonnet".to_string(),
            session_id: None,
            allowed_tools: Vec::new(),
        });
        assert_eq!(
            args,
            vec!["--model", "sonnet", "--print", "--output-format", "json"]
        );
    }

    #[test]
    fn test_build_args_resume_and_tools() {
        let args = ClaudeCliProvider::build_args(&ProviderRequest {
            prompt: "hi".to_string(),
            model: "sonnet".to_string(),
            session_id: Some(SessionId::from("s1")),
            allowed_tools: vec!["Bash".to_string(), "Read".to_string()],
        });
        assert!(args.windows(2).any(|w| w == ["--resume", "s1"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Bash,Read"]));
    }

    #[test]
    fn test_parse_output_with_banner() {
        let out = "starting up...\n{\"result\": \"hello\", \"session_id\": \"s2\", \"usage\": {\"output_tokens\": 5}}";
        let response = ClaudeCliProvider::parse_output(out).unwrap();
        assert_eq!(response.result, "hello");
        assert_eq!(response.session_id.as_str(), "s2");
        assert_eq!(response.usage.unwrap()["output_tokens"], 5);
    }

    #[test]
    fn test_parse_output_camel_case_session() {
        let out = "{\"result\": \"x\", \"sessionId\": \"s3\"}";
        let response = ClaudeCliProvider::parse_output(out).unwrap();
        assert_eq!(response.session_id.as_str(), "s3");
    }

    #[test]
    fn test_parse_output_rejects_garbage() {
        assert!(matches!(
            ClaudeCliProvider::parse_output("no json here"),
            Err(CompletionError::MalformedOutput(_))
        ));
        assert!(matches!(
            ClaudeCliProvider::parse_output("{\"result\": \"x\"}"),
            Err(CompletionError::MalformedOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_is_request_fatal() {
        let provider = ClaudeCliProvider::new("ksi-test-definitely-not-a-binary");
        let err = provider
            .complete(&ProviderRequest {
                prompt: "hi".to_string(),
                model: "sonnet".to_string(),
                session_id: None,
                allowed_tools: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::ExecutableNotFound(_)));
    }
}
