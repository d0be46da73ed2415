//! Completion response logs.
//!
//! Each completed turn appends one JSON line to
//! `<response_log_dir>/<session_id>.jsonl` containing the full request
//! and response. The files survive restarts and are the ground truth
//! for conversation replay; `completion:result` on the bus remains the
//! authoritative live channel — nothing tails these files.
//!
//! Per-session serialization guarantees there is never more than one
//! writer per file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::handler_fn;
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::CompletionResult;

/// Append-only writer for per-session response logs.
#[derive(Debug)]
pub struct ResponseLogger {
    dir: PathBuf,
}

impl ResponseLogger {
    /// Create a logger writing under `dir` (created on demand).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    /// Append one turn to the session's log file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the write
    /// fails.
    pub async fn append(
        &self,
        session_id: &str,
        request: &Value,
        response: &Value,
    ) -> CompletionResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "request": request,
            "response": response,
        });
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Session ids with a log file, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read (missing
    /// directory yields an empty list).
    pub async fn list_sessions(&self) -> CompletionResult<Vec<String>> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(session) = name.strip_suffix(".jsonl") {
                sessions.push(session.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Read a session's turns, most recent last, truncated to `limit`
    /// (most recent kept). Unparseable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn read_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> CompletionResult<Vec<Value>> {
        let content = tokio::fs::read_to_string(self.path_for(session_id)).await?;
        let mut turns: Vec<Value> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => turns.push(value),
                Err(e) => warn!(session_id, error = %e, "skipping unparseable log line"),
            }
        }
        if turns.len() > limit {
            let skip = turns.len().saturating_sub(limit);
            turns.drain(..skip);
        }
        Ok(turns)
    }
}

/// Plugin exposing the response logs over the bus.
pub struct ConversationPlugin {
    logger: Arc<ResponseLogger>,
}

impl ConversationPlugin {
    /// Create the plugin around a logger.
    #[must_use]
    pub fn new(logger: Arc<ResponseLogger>) -> Self {
        Self { logger }
    }
}

impl KsiPlugin for ConversationPlugin {
    fn name(&self) -> &str {
        "conversation_service"
    }

    fn summary(&self) -> &str {
        "Browse completion response logs"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let logger = Arc::clone(&self.logger);
        let list_handler = handler_fn(move |_, _, _| {
            let logger = Arc::clone(&logger);
            async move {
                match logger.list_sessions().await {
                    Ok(sessions) => Ok(Some(json!({
                        "count": sessions.len(),
                        "sessions": sessions,
                    }))),
                    Err(e) => Ok(Some(
                        ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value(),
                    )),
                }
            }
        });

        let logger = Arc::clone(&self.logger);
        let get_handler = handler_fn(move |_, data, _| {
            let logger = Arc::clone(&logger);
            async move {
                let Some(session_id) = data.get("session_id").and_then(Value::as_str) else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing required field: session_id",
                        )
                        .to_value(),
                    ));
                };
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|l| usize::try_from(l).ok())
                    .unwrap_or(100);
                match logger.read_session(session_id, limit).await {
                    Ok(turns) => Ok(Some(json!({
                        "session_id": session_id,
                        "count": turns.len(),
                        "turns": turns,
                    }))),
                    Err(e) => Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::NotFound,
                            format!("no conversation log for {session_id}: {e}"),
                        )
                        .to_value(),
                    )),
                }
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("conversation:list")
                    .summary("List sessions with response logs"),
                list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("conversation:get")
                    .summary("Read one session's logged turns")
                    .param("session_id", Param::new(ParamType::String).required())
                    .param("limit", Param::new(ParamType::Integer).default_value(json!(100))),
                get_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ResponseLogger::new(dir.path());
        logger
            .append("s1", &json!({"prompt": "a"}), &json!({"result": "b"}))
            .await
            .unwrap();
        logger
            .append("s1", &json!({"prompt": "c"}), &json!({"result": "d"}))
            .await
            .unwrap();

        let turns = logger.read_session("s1", 100).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["request"]["prompt"], "a");
        assert_eq!(turns[1]["response"]["result"], "d");
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ResponseLogger::new(dir.path());
        for i in 0..5 {
            logger
                .append("s1", &json!({"i": i}), &json!({}))
                .await
                .unwrap();
        }
        let turns = logger.read_session("s1", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["request"]["i"], 3);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ResponseLogger::new(dir.path());
        assert!(logger.list_sessions().await.unwrap().is_empty());
        logger.append("s2", &json!({}), &json!({})).await.unwrap();
        logger.append("s1", &json!({}), &json!({})).await.unwrap();
        assert_eq!(
            logger.list_sessions().await.unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );
    }
}
