//! Streaming agent execution inside a sandbox host.

use std::process::Stdio;
use std::sync::Arc;

use shared::SandboxServerMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::crypto;
use crate::error::AppError;

use super::host::ExecutionHost;

/// Unencrypted keys carrying this prefix are accepted as-is. Deliberate
/// backward-compatibility exception; everything else must decrypt.
pub const PLAINTEXT_KEY_PREFIX: &str = "sk-ant-";

/// Recover the agent API key from an `execute` request payload: either a
/// recognizable plaintext key, or a ciphertext for the caller-derived key.
pub fn resolve_api_key(raw: &str, key: &[u8; crypto::KEY_LEN]) -> Result<String, AppError> {
    if raw.starts_with(PLAINTEXT_KEY_PREFIX) {
        return Ok(raw.to_string());
    }
    crypto::decrypt(raw, key)
}

/// Run the agent to completion, forwarding stdout lines as `stream` events in
/// arrival order and finishing with `complete` (or `error`). Event-send
/// failures are ignored: a disconnected caller does not cancel the run.
pub async fn execute_agent(
    host: Arc<ExecutionHost>,
    agent_command: String,
    api_key: String,
    task: String,
    context: Option<String>,
    events: mpsc::Sender<SandboxServerMessage>,
) {
    let prompt = match context {
        Some(context) => format!("{context}\n\n{task}"),
        None => task,
    };

    let mut child = match Command::new(&agent_command)
        .arg("-p")
        .arg(&prompt)
        .current_dir(&host.repo_root)
        .env("ANTHROPIC_API_KEY", &api_key)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to spawn agent '{}': {}", agent_command, e);
            let _ = events
                .send(SandboxServerMessage::Error {
                    message: format!("failed to start agent: {e}"),
                })
                .await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Drain stderr concurrently so the child cannot block on a full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("agent stderr: {}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    });

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = events.send(SandboxServerMessage::Stream { data: line }).await;
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events
                        .send(SandboxServerMessage::Error {
                            message: format!("stream read failed: {e}"),
                        })
                        .await;
                    break;
                }
            }
        }
    }

    let stderr_text = stderr_task.await.unwrap_or_default();

    match child.wait().await {
        Ok(status) => {
            let exit_code = status.code().unwrap_or(-1);
            if exit_code != 0 && !stderr_text.is_empty() {
                let _ = events
                    .send(SandboxServerMessage::Error {
                        message: stderr_text.trim_end().to_string(),
                    })
                    .await;
            }
            let _ = events.send(SandboxServerMessage::Complete { exit_code }).await;
        }
        Err(e) => {
            let _ = events
                .send(SandboxServerMessage::Error {
                    message: format!("agent wait failed: {e}"),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    #[test]
    fn test_resolve_api_key_decrypts() {
        let key = derive_key("caller-key", "workspace");
        let payload = crypto::encrypt("sk-other-12345", &key).unwrap();
        assert_eq!(resolve_api_key(&payload, &key).unwrap(), "sk-other-12345");
    }

    // The plaintext prefix path is a known-accepted compatibility exception,
    // not the normal flow.
    #[test]
    fn test_resolve_api_key_plaintext_prefix_exception() {
        let key = derive_key("caller-key", "workspace");
        assert_eq!(
            resolve_api_key("sk-ant-plaintext", &key).unwrap(),
            "sk-ant-plaintext"
        );
    }

    #[test]
    fn test_resolve_api_key_rejects_garbage() {
        let key = derive_key("caller-key", "workspace");
        assert!(matches!(
            resolve_api_key("neither-plaintext-nor-ciphertext", &key),
            Err(AppError::Decryption)
        ));
    }

    #[tokio::test]
    async fn test_agent_streams_and_completes() {
        use tempfile::TempDir;

        let workdir = TempDir::new().unwrap();
        let repo_root = workdir.path().join("repo");
        std::fs::create_dir_all(&repo_root).unwrap();
        let host = std::sync::Arc::new(ExecutionHost::for_tests(workdir, repo_root));

        let (tx, mut rx) = mpsc::channel(16);
        // `echo` stands in for the agent binary; "-p <prompt>" is echoed back.
        execute_agent(
            host,
            "echo".into(),
            "sk-ant-test".into(),
            "hello".into(),
            None,
            tx,
        )
        .await;

        let first = rx.recv().await.unwrap();
        match first {
            SandboxServerMessage::Stream { data } => assert!(data.contains("hello")),
            other => panic!("expected stream, got {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, SandboxServerMessage::Complete { exit_code: 0 }));
    }
}
