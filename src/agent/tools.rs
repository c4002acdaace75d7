//! Sandboxed tool implementations behind the firewall.
//!
//! These execute only after `guard_action` returns allow, and only on the
//! sanitized payload (paths already resolved inside the jail).

use glob::glob;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::firewall::DEFAULT_READ_CAP;

/// List entries under a directory, one per line, directories suffixed `/`.
pub fn list_files(path: &Path) -> Result<String> {
    let pattern = path.join("*");
    let pattern_str = pattern
        .to_str()
        .ok_or_else(|| Error::validation("non-utf8 path"))?;

    let mut lines = Vec::new();
    for entry in
        glob(pattern_str).map_err(|e| Error::validation(format!("bad glob: {}", e)))?
    {
        let entry = entry.map_err(|e| Error::storage(format!("list failed: {}", e)))?;
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if entry.is_dir() {
            lines.push(format!("{}/", name));
        } else {
            lines.push(name);
        }
    }
    lines.sort();
    Ok(lines.join("\n"))
}

/// Read a file, truncated at the policy cap.
pub fn read_file(path: &Path, max_bytes: usize) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::storage(format!("read '{}': {}", path.display(), e)))?;
    let truncated = bytes.len() > max_bytes;
    let slice = &bytes[..bytes.len().min(max_bytes)];
    let mut content = String::from_utf8_lossy(slice).into_owned();
    if truncated {
        content.push_str("\n[truncated]");
    }
    Ok(content)
}

/// Regex search across files under `root`, capped at `max_matches` lines of
/// `path:line_no: text` output.
pub fn search_text(root: &Path, pattern: &str, max_matches: usize) -> Result<String> {
    let regex =
        Regex::new(pattern).map_err(|e| Error::validation(format!("bad pattern: {}", e)))?;
    let glob_pattern = root.join("**/*");
    let glob_str = glob_pattern
        .to_str()
        .ok_or_else(|| Error::validation("non-utf8 path"))?;

    let mut matches = Vec::new();
    'files: for entry in
        glob(glob_str).map_err(|e| Error::validation(format!("bad glob: {}", e)))?
    {
        let Ok(file) = entry else { continue };
        if !file.is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue; // binary or unreadable files are skipped
        };
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                let relative = file.strip_prefix(root).unwrap_or(&file);
                matches.push(format!("{}:{}: {}", relative.display(), line_no + 1, line));
                if matches.len() >= max_matches {
                    break 'files;
                }
            }
        }
    }
    Ok(matches.join("\n"))
}

/// Write file contents, creating parent directories as needed.
pub fn edit_file(path: &Path, content: &str) -> Result<String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::storage(format!("mkdir '{}': {}", parent.display(), e)))?;
    }
    std::fs::write(path, content)
        .map_err(|e| Error::storage(format!("write '{}': {}", path.display(), e)))?;
    Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
}

/// Run a shell command with a wall-clock timeout, capturing combined
/// output. Used by both the bounded `run` tool and the approval-gated
/// `exec` tool; the firewall decides which is permitted.
pub async fn run_command(command: &str, cwd: &Path, timeout_s: u64) -> Result<String> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(timeout_s), child)
        .await
        .map_err(|_| Error::timeout(timeout_s * 1000))?
        .map_err(|e| Error::storage(format!("command failed to start: {}", e)))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if text.len() > DEFAULT_READ_CAP {
        text.truncate(DEFAULT_READ_CAP);
        text.push_str("\n[truncated]");
    }

    if output.status.success() {
        Ok(text)
    } else {
        Err(Error::storage(format!(
            "command exited with {}: {}",
            output.status.code().unwrap_or(-1),
            text.trim()
        )))
    }
}

/// Perform an outbound HTTP request (dangerous tier; reaches here only
/// after operator approval or with operator authority).
pub async fn http_request(url: &str, method: Option<&str>, timeout_s: u64) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_s))
        .build()
        .map_err(|e| Error::provider("http", format!("client: {}", e)))?;

    let request = match method.unwrap_or("GET").to_uppercase().as_str() {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "HEAD" => client.head(url),
        other => {
            return Err(Error::validation(format!(
                "unsupported HTTP method '{}'",
                other
            )))
        }
    };

    let response = request
        .send()
        .await
        .map_err(|e| Error::provider("http", format!("request failed: {}", e)))?;
    let status = response.status();
    let mut body = response
        .text()
        .await
        .map_err(|e| Error::provider("http", format!("read body: {}", e)))?;
    if body.len() > DEFAULT_READ_CAP {
        body.truncate(DEFAULT_READ_CAP);
        body.push_str("\n[truncated]");
    }
    Ok(format!("{}\n{}", status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let listing = list_files(dir.path()).unwrap();
        assert_eq!(listing, "a.txt\nb.txt\nsub/");
    }

    #[test]
    fn test_read_file_caps_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "abcdefghij").unwrap();

        let content = read_file(&path, 4).unwrap();
        assert_eq!(content, "abcd\n[truncated]");

        let full = read_file(&path, 100).unwrap();
        assert_eq!(full, "abcdefghij");
    }

    #[test]
    fn test_search_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn alpha() {}\nfn beta() {}").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.rs"), "fn alpha_two() {}").unwrap();

        let results = search_text(dir.path(), r"fn alpha", 10).unwrap();
        assert!(results.contains("a.rs:1: fn alpha() {}"));
        assert!(results.contains("sub/b.rs:1: fn alpha_two() {}"));

        let capped = search_text(dir.path(), r"fn", 1).unwrap();
        assert_eq!(capped.lines().count(), 1);
    }

    #[test]
    fn test_edit_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/file.txt");

        let report = edit_file(&path, "hello").unwrap();
        assert!(report.contains("5 bytes"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_command("echo hello", dir.path(), 10).await.unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command("exit 3", dir.path(), 10).await.unwrap_err();
        assert!(err.to_string().contains("exited with 3"));
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command("sleep 5", dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
