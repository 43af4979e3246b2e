//! Single-shot tool execution against a sandbox's repo clone.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::error::AppError;

use super::host::ExecutionHost;

const GREP_MATCH_LIMIT: usize = 200;

#[derive(Debug)]
pub struct ToolOutput {
    pub output: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    fn text(output: String) -> Self {
        Self {
            output,
            exit_code: None,
        }
    }
}

/// Run one named tool. Tool names mirror the agent-visible surface; anything
/// else fails with [`AppError::UnsupportedTool`].
pub async fn execute_tool(
    host: &ExecutionHost,
    name: &str,
    input: &Value,
) -> Result<ToolOutput, AppError> {
    match name {
        "Bash" => bash(host, input).await,
        "Read" => read(host, input).await,
        "Write" => write(host, input).await,
        "Edit" => edit(host, input).await,
        "Glob" => glob_tool(host, input),
        "Grep" => grep(host, input),
        other => Err(AppError::UnsupportedTool(other.to_string())),
    }
}

fn str_field<'a>(input: &'a Value, key: &str) -> Result<&'a str, AppError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation(format!("missing tool input field '{key}'")))
}

async fn bash(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let command = str_field(input, "command")?;
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&host.repo_root)
        .stdin(Stdio::null())
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(ToolOutput {
        output: combined,
        exit_code: output.status.code(),
    })
}

async fn read(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let path = host.resolve(str_field(input, "file_path")?)?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AppError::Validation(format!("read {}: {e}", path.display())))?;
    Ok(ToolOutput::text(content))
}

async fn write(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let path = host.resolve(str_field(input, "file_path")?)?;
    let content = str_field(input, "content")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(ToolOutput::text(format!("wrote {} bytes", content.len())))
}

async fn edit(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let path = host.resolve(str_field(input, "file_path")?)?;
    let old = str_field(input, "old_string")?;
    let new = str_field(input, "new_string")?;

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AppError::Validation(format!("read {}: {e}", path.display())))?;
    if !content.contains(old) {
        return Err(AppError::Validation("old_string not found in file".into()));
    }
    let updated = content.replacen(old, new, 1);
    tokio::fs::write(&path, updated).await?;
    Ok(ToolOutput::text("edit applied".into()))
}

fn glob_tool(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let pattern = str_field(input, "pattern")?;
    // Anchor the pattern inside the clone; resolve() rejects traversal.
    host.resolve(pattern)?;
    let full = host.repo_root.join(pattern);
    let full = full
        .to_str()
        .ok_or_else(|| AppError::Validation("non-utf8 glob pattern".into()))?;

    let mut matches = Vec::new();
    for entry in
        glob::glob(full).map_err(|e| AppError::Validation(format!("bad glob pattern: {e}")))?
    {
        let path = entry.map_err(|e| AppError::Internal(e.to_string()))?;
        if let Ok(rel) = path.strip_prefix(&host.repo_root) {
            matches.push(rel.display().to_string());
        }
    }
    matches.sort();
    Ok(ToolOutput::text(matches.join("\n")))
}

fn grep(host: &ExecutionHost, input: &Value) -> Result<ToolOutput, AppError> {
    let pattern = str_field(input, "pattern")?;
    let re = regex::Regex::new(pattern)
        .map_err(|e| AppError::Validation(format!("bad regex: {e}")))?;

    let root = match input.get("path").and_then(Value::as_str) {
        Some(path) => host.resolve(path)?,
        None => host.repo_root.clone(),
    };

    let mut lines = Vec::new();
    'outer: for entry in WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        // Binary and unreadable files are skipped, not errors.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (num, line) in content.lines().enumerate() {
            if re.is_match(line) {
                let rel = entry
                    .path()
                    .strip_prefix(&host.repo_root)
                    .unwrap_or(entry.path());
                lines.push(format!("{}:{}:{}", rel.display(), num + 1, line));
                if lines.len() >= GREP_MATCH_LIMIT {
                    break 'outer;
                }
            }
        }
    }
    Ok(ToolOutput::text(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_host() -> Arc<ExecutionHost> {
        let workdir = TempDir::new().unwrap();
        let repo_root = workdir.path().join("repo");
        std::fs::create_dir_all(&repo_root).unwrap();
        Arc::new(ExecutionHost::for_tests(workdir, repo_root))
    }

    #[tokio::test]
    async fn test_unsupported_tool() {
        let host = test_host();
        let err = execute_tool(&host, "WebFetch", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedTool(_)));
    }

    #[tokio::test]
    async fn test_write_read_edit_roundtrip() {
        let host = test_host();
        execute_tool(
            &host,
            "Write",
            &serde_json::json!({"file_path": "src/lib.rs", "content": "fn a() {}"}),
        )
        .await
        .unwrap();

        execute_tool(
            &host,
            "Edit",
            &serde_json::json!({"file_path": "src/lib.rs", "old_string": "fn a", "new_string": "fn b"}),
        )
        .await
        .unwrap();

        let out = execute_tool(
            &host,
            "Read",
            &serde_json::json!({"file_path": "src/lib.rs"}),
        )
        .await
        .unwrap();
        assert_eq!(out.output, "fn b() {}");
    }

    #[tokio::test]
    async fn test_edit_requires_match() {
        let host = test_host();
        execute_tool(
            &host,
            "Write",
            &serde_json::json!({"file_path": "a.txt", "content": "hello"}),
        )
        .await
        .unwrap();
        let err = execute_tool(
            &host,
            "Edit",
            &serde_json::json!({"file_path": "a.txt", "old_string": "absent", "new_string": "x"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bash_runs_in_repo_root() {
        let host = test_host();
        std::fs::write(host.repo_root.join("marker.txt"), "x").unwrap();
        let out = execute_tool(&host, "Bash", &serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.output.contains("marker.txt"));
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_bash_nonzero_exit() {
        let host = test_host();
        let out = execute_tool(&host, "Bash", &serde_json::json!({"command": "exit 3"}))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_glob_and_grep() {
        let host = test_host();
        std::fs::create_dir_all(host.repo_root.join("src")).unwrap();
        std::fs::write(host.repo_root.join("src/a.rs"), "fn alpha() {}\n").unwrap();
        std::fs::write(host.repo_root.join("src/b.rs"), "fn beta() {}\n").unwrap();

        let out = execute_tool(&host, "Glob", &serde_json::json!({"pattern": "src/*.rs"}))
            .await
            .unwrap();
        assert_eq!(out.output, "src/a.rs\nsrc/b.rs");

        let out = execute_tool(&host, "Grep", &serde_json::json!({"pattern": "alpha"}))
            .await
            .unwrap();
        assert_eq!(out.output, "src/a.rs:1:fn alpha() {}");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let host = test_host();
        let err = execute_tool(
            &host,
            "Read",
            &serde_json::json!({"file_path": "../../etc/passwd"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
