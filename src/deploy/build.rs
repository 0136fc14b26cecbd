//! Build context packaging and build-output parsing.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use serde_json::Value;
use walkdir::WalkDir;

use super::context::TaskContext;
use crate::docker::ByteStream;

/// Directory names left out of every build context.
pub const CONTEXT_EXCLUDES: &[&str] = &[".git", "node_modules", "vendor"];

/// Longest buffered output line before it is flushed as-is.
const MAX_LINE: usize = 1024 * 1024;

/// `repo_path` itself for an empty or `/` base path, else the subdirectory.
pub fn resolve_context(repo_path: &Path, base_path: &str) -> Result<PathBuf> {
    let trimmed = base_path.trim().trim_matches('/');
    let dir = if trimmed.is_empty() {
        repo_path.to_path_buf()
    } else {
        let rel = Path::new(trimmed);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            bail!("Invalid base path '{}'", base_path);
        }
        repo_path.join(rel)
    };
    if !dir.is_dir() {
        bail!("Build context {} does not exist", dir.display());
    }
    Ok(dir)
}

fn is_excluded(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(name) => CONTEXT_EXCLUDES.iter().any(|ex| name == *ex),
        _ => false,
    })
}

/// Tar archive of `dir` with paths relative to it.
pub fn tar_context(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let walker = WalkDir::new(dir).min_depth(1).into_iter().filter_entry(|e| {
        e.path()
            .strip_prefix(dir)
            .map(|rel| !is_excluded(rel))
            .unwrap_or(false)
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .context("Walked outside the build context")?;
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("Failed to add {} to build context", rel.display()))?;
    }
    builder
        .into_inner()
        .context("Failed to finish build context archive")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Log(String),
    Error(String),
}

/// Splits the engine's newline-delimited JSON build output into events.
#[derive(Debug, Default)]
pub struct BuildOutputParser {
    buf: Vec<u8>,
}

impl BuildOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                let line = std::mem::take(&mut self.buf);
                events.extend(parse_line(&line));
            } else {
                self.buf.push(b);
                if self.buf.len() >= MAX_LINE {
                    let line = std::mem::take(&mut self.buf);
                    events.extend(parse_line(&line));
                }
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<BuildEvent> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(raw: &[u8]) -> Option<BuildEvent> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Some(BuildEvent::Log(format!("Build: {text}")));
    };
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::trim);

    if let Some(message) = value
        .get("errorDetail")
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .or_else(|| field("error"))
    {
        return Some(BuildEvent::Error(format!("Build error: {}", message.trim())));
    }
    if let Some(stream) = field("stream") {
        // Progress redraws arrive as carriage-return separated frames.
        let last = stream.rsplit('\r').find(|s| !s.trim().is_empty())?;
        return Some(BuildEvent::Log(format!("Build: {}", last.trim())));
    }
    if let Some(status) = field("status") {
        let mut line = format!("Build: {status}");
        if let Some(id) = field("id") {
            line = format!("Build: {id}: {status}");
        }
        return Some(BuildEvent::Log(line));
    }
    None
}

/// Write build output to the deployment log. Fails on the first error frame.
pub async fn consume_build_output(ctx: &TaskContext, mut stream: ByteStream) -> Result<()> {
    let mut parser = BuildOutputParser::new();
    let mut first_error = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Build output stream failed")?;
        for event in parser.push(&chunk) {
            record(ctx, event, &mut first_error).await;
        }
    }
    for event in parser.finish() {
        record(ctx, event, &mut first_error).await;
    }
    match first_error {
        Some(message) => bail!("{}", message),
        None => Ok(()),
    }
}

async fn record(ctx: &TaskContext, event: BuildEvent, first_error: &mut Option<String>) {
    match event {
        BuildEvent::Log(line) => ctx.add_log(line).await,
        BuildEvent::Error(line) => {
            ctx.add_log(line.clone()).await;
            first_error.get_or_insert(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = BuildOutputParser::new();
        assert!(parser.push(br#"{"stream":"Step 1/2 : FR"#).is_empty());
        let events = parser.push(b"OM node\\n\"}\n{\"stream\":\"\\n\"}\n");
        assert_eq!(events, vec![BuildEvent::Log("Build: Step 1/2 : FROM node".into())]);
    }

    #[test]
    fn test_parser_error_frames_and_verbatim_lines() {
        let mut parser = BuildOutputParser::new();
        let events = parser.push(
            b"{\"errorDetail\":{\"message\":\"no such file\"},\"error\":\"no such file\"}\nplain text\n{\"status\":\"Downloading\",\"id\":\"abc\"}\n",
        );
        assert_eq!(
            events,
            vec![
                BuildEvent::Error("Build error: no such file".into()),
                BuildEvent::Log("Build: plain text".into()),
                BuildEvent::Log("Build: abc: Downloading".into()),
            ]
        );
        assert!(parser.push(b"{\"aux\":{\"ID\":\"sha256:1\"}}\n").is_empty());
    }

    #[test]
    fn test_parser_keeps_last_carriage_return_frame() {
        let mut parser = BuildOutputParser::new();
        parser.push(br#"{"stream":"10%\r50%\r100%\r"}"#);
        assert_eq!(parser.finish(), vec![BuildEvent::Log("Build: 100%".into())]);
    }

    #[test]
    fn test_parser_bounds_line_buffer() {
        let mut parser = BuildOutputParser::new();
        let events = parser.push(&vec![b'x'; MAX_LINE + 10]);
        assert_eq!(events.len(), 1);
        assert_eq!(parser.finish().len(), 1);
    }

    #[test]
    fn test_resolve_context() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps/web")).unwrap();
        assert_eq!(resolve_context(dir.path(), "/").unwrap(), dir.path());
        assert_eq!(resolve_context(dir.path(), "").unwrap(), dir.path());
        assert_eq!(
            resolve_context(dir.path(), "/apps/web/").unwrap(),
            dir.path().join("apps/web")
        );
        assert!(resolve_context(dir.path(), "missing").is_err());
        assert!(resolve_context(dir.path(), "../etc").is_err());
    }

    #[test]
    fn test_tar_context_excludes_vendor_dirs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        for ex in CONTEXT_EXCLUDES {
            fs::create_dir_all(dir.path().join(ex)).unwrap();
            fs::write(dir.path().join(ex).join("junk"), "x").unwrap();
        }
        fs::create_dir_all(dir.path().join("src/node_modules")).unwrap();
        fs::write(dir.path().join("src/node_modules/pkg.js"), "x").unwrap();

        let bytes = tar_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "Dockerfile"));
        assert!(names.iter().any(|n| n == "src/main.rs"));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
        assert!(!names.iter().any(|n| n.starts_with(".git") || n.starts_with("vendor")));
    }
}
