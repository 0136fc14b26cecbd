//! Exclusion rules shared by the watcher and the initial walk.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use glob::Pattern;
use tokio::process::Command;
use tracing::debug;

/// Segments that are never synced.
pub const ALWAYS_EXCLUDED: [&str; 2] = [".git", "node_modules"];

/// Upper bound for one `git check-ignore` call.
pub const CHECK_IGNORE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IgnoreRules {
    root: PathBuf,
    excludes: Vec<Pattern>,
    gitignore: Vec<Pattern>,
    cache: Mutex<HashMap<PathBuf, bool>>,
}

/// Non-negation patterns of `<root>/.gitignore`, with anchors and
/// trailing slashes stripped.
pub fn read_gitignore(root: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(root.join(".gitignore")) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .map(|l| l.trim_start_matches('/').trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

impl IgnoreRules {
    pub fn new(root: impl Into<PathBuf>, excludes: &[String]) -> Result<Self> {
        let root = root.into();
        let excludes = excludes
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid exclude pattern '{}'", p)))
            .collect::<Result<Vec<_>>>()?;
        let gitignore = read_gitignore(&root)
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    debug!(pattern = %p, "skipping unparsable .gitignore line: {e}");
                    None
                }
            })
            .collect();
        Ok(Self {
            root,
            excludes,
            gitignore,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute or relative to the root) is excluded by the
    /// hard-wired segments, the caller globs or `.gitignore`.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(path) {
                return *hit;
            }
        }
        let excluded = self.evaluate(path);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), excluded);
        }
        excluded
    }

    fn evaluate(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let segments: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            return false;
        }
        if segments.iter().any(|s| ALWAYS_EXCLUDED.contains(s)) {
            return true;
        }
        // A glob on a directory name excludes everything below it.
        if segments
            .iter()
            .any(|s| self.excludes.iter().any(|p| p.matches(s)))
        {
            return true;
        }
        let joined = segments.join("/");
        self.gitignore.iter().any(|p| {
            p.matches(&joined)
                || segments.iter().any(|s| p.matches(s))
                || (1..segments.len()).any(|n| p.matches(&segments[..n].join("/")))
        })
    }

    /// Ask git whether `path` is ignored. Any failure, including a missing
    /// git binary or a non-repository root, counts as not ignored.
    pub async fn git_check_ignore(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(["check-ignore", "-q", "--"])
            .arg(relative)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(CHECK_IGNORE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("git check-ignore unavailable: {e}");
                false
            }
            Err(_) => {
                debug!(path = %relative.display(), "git check-ignore timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rules_with(gitignore: &str, excludes: &[&str]) -> (tempfile::TempDir, IgnoreRules) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), gitignore).unwrap();
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        let rules = IgnoreRules::new(dir.path(), &excludes).unwrap();
        (dir, rules)
    }

    #[test]
    fn test_hard_wired_segments() {
        let (dir, rules) = rules_with("", &[]);
        assert!(rules.is_excluded(&dir.path().join(".git/HEAD")));
        assert!(rules.is_excluded(&dir.path().join("web/node_modules/react/index.js")));
        assert!(!rules.is_excluded(&dir.path().join("src/main.rs")));
        assert!(!rules.is_excluded(dir.path()));
    }

    #[test]
    fn test_caller_globs_match_names() {
        let (dir, rules) = rules_with("", &["*.log", "target"]);
        assert!(rules.is_excluded(&dir.path().join("logs/app.log")));
        assert!(rules.is_excluded(&dir.path().join("target/debug/app")));
        assert!(!rules.is_excluded(&dir.path().join("src/log.rs")));
    }

    #[test]
    fn test_gitignore_patterns_and_negations() {
        let (dir, rules) = rules_with("# build output\n/dist/\n*.tmp\n\n!keep.tmp\nout/cache\n", &[]);
        assert!(rules.is_excluded(&dir.path().join("dist/bundle.js")));
        assert!(rules.is_excluded(&dir.path().join("notes.tmp")));
        // Negations are not honoured.
        assert!(rules.is_excluded(&dir.path().join("keep.tmp")));
        assert!(rules.is_excluded(&dir.path().join("out/cache/a.bin")));
        assert!(!rules.is_excluded(&dir.path().join("out/other.bin")));
        assert!(!rules.is_excluded(&dir.path().join("src/index.ts")));
    }

    #[test]
    fn test_read_gitignore_filters_lines() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "#c\n\n!x\n/a/\nb\n").unwrap();
        assert_eq!(read_gitignore(dir.path()), vec!["a".to_string(), "b".to_string()]);
        assert!(read_gitignore(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_invalid_exclude_is_error() {
        let dir = tempdir().unwrap();
        assert!(IgnoreRules::new(dir.path(), &["[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_check_ignore_outside_repo_is_false() {
        let (dir, rules) = rules_with("", &[]);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        assert!(!rules.git_check_ignore(&dir.path().join("a.txt")).await);
    }
}
