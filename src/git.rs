//! Repository checkout for deployments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, Oid, Repository};
use tracing::{debug, info};
use uuid::Uuid;

use crate::deploy::models::{Environment, TriggerKind};

/// One clone job.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub repository: String,
    pub branch: String,
    pub user_id: Uuid,
    pub environment: Environment,
    pub deployment_id: Uuid,
    pub application_id: Uuid,
    pub kind: TriggerKind,
    /// Check out this commit after cloning when non-empty.
    pub commit_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonedRepo {
    pub path: PathBuf,
    /// Commit actually checked out.
    pub commit_hash: String,
}

#[async_trait]
pub trait GitSource: Send + Sync {
    async fn clone_repository(&self, request: CloneRequest) -> Result<ClonedRepo>;
    async fn remove_repository(&self, path: &Path) -> Result<()>;
}

/// `{mount_root}/{user_id}/{environment}/{deployment_id}`.
pub fn workdir_path(
    mount_root: &Path,
    user_id: Uuid,
    environment: Environment,
    deployment_id: Uuid,
) -> PathBuf {
    mount_root
        .join(user_id.to_string())
        .join(environment.as_str())
        .join(deployment_id.to_string())
}

/// Clones with libgit2 into deterministic per-deployment directories.
pub struct Git2Source {
    mount_root: PathBuf,
    /// Prefix for bare repository identifiers such as `owner/name`.
    base_url: String,
}

impl Git2Source {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            base_url: "https://github.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Clone URL for a repository identifier. URLs, scp-style remotes and
    /// absolute paths are used as given.
    pub fn resolve_url(&self, repository: &str) -> String {
        if repository.contains("://") || repository.starts_with("git@") || repository.starts_with('/')
        {
            repository.to_string()
        } else {
            format!(
                "{}/{}.git",
                self.base_url.trim_end_matches('/'),
                repository.trim_end_matches(".git")
            )
        }
    }
}

fn clone_blocking(url: &str, branch: &str, target: &Path, commit_hash: &str) -> Result<String> {
    // A redelivered task reuses the same directory.
    if target.exists() {
        std::fs::remove_dir_all(target)
            .with_context(|| format!("Failed to clear {}", target.display()))?;
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(FetchOptions::new());
    if !branch.is_empty() {
        builder.branch(branch);
    }
    let repo = builder
        .clone(url, target)
        .with_context(|| format!("Failed to clone {} (branch {})", url, branch))?;

    if !commit_hash.is_empty() {
        checkout_commit(&repo, commit_hash)?;
    }

    let head = repo
        .head()
        .context("Cloned repository has no HEAD")?
        .peel_to_commit()
        .context("HEAD is not a commit")?;
    Ok(head.id().to_string())
}

fn checkout_commit(repo: &Repository, commit_hash: &str) -> Result<()> {
    let oid = Oid::from_str(commit_hash)
        .with_context(|| format!("Invalid commit hash '{}'", commit_hash))?;
    let commit = repo
        .find_commit(oid)
        .with_context(|| format!("Commit {} not found in repository", commit_hash))?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
        .with_context(|| format!("Failed to check out {}", commit_hash))?;
    repo.set_head_detached(oid)
        .context("Failed to detach HEAD")?;
    Ok(())
}

#[async_trait]
impl GitSource for Git2Source {
    async fn clone_repository(&self, request: CloneRequest) -> Result<ClonedRepo> {
        let url = self.resolve_url(&request.repository);
        let target = workdir_path(
            &self.mount_root,
            request.user_id,
            request.environment,
            request.deployment_id,
        );
        info!(
            application_id = %request.application_id,
            deployment_id = %request.deployment_id,
            kind = %request.kind,
            "cloning {}@{}",
            url,
            request.branch
        );
        let path = target.clone();
        let commit_hash = tokio::task::spawn_blocking(move || {
            clone_blocking(&url, &request.branch, &path, &request.commit_hash)
        })
        .await
        .context("Clone task panicked")??;
        debug!(path = %target.display(), commit = %commit_hash, "clone finished");
        Ok(ClonedRepo {
            path: target,
            commit_hash,
        })
    }

    async fn remove_repository(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let oid = if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap()
        };
        let commit = repo.find_commit(oid).unwrap();
        repo.branch("main", &commit, true).unwrap();
        oid.to_string()
    }

    fn request(repo: &Path, commit_hash: &str) -> CloneRequest {
        CloneRequest {
            repository: repo.display().to_string(),
            branch: "main".into(),
            user_id: Uuid::new_v4(),
            environment: Environment::Staging,
            deployment_id: Uuid::new_v4(),
            application_id: Uuid::new_v4(),
            kind: TriggerKind::Create,
            commit_hash: commit_hash.into(),
        }
    }

    #[test]
    fn test_workdir_layout() {
        let user = Uuid::new_v4();
        let dep = Uuid::new_v4();
        let path = workdir_path(Path::new("/srv"), user, Environment::Production, dep);
        assert_eq!(
            path,
            PathBuf::from(format!("/srv/{user}/production/{dep}"))
        );
    }

    #[test]
    fn test_resolve_url() {
        let git = Git2Source::new("/tmp");
        assert_eq!(git.resolve_url("acme/web"), "https://github.com/acme/web.git");
        assert_eq!(git.resolve_url("acme/web.git"), "https://github.com/acme/web.git");
        assert_eq!(git.resolve_url("git@host:acme/web.git"), "git@host:acme/web.git");
        assert_eq!(git.resolve_url("/srv/repo"), "/srv/repo");
        let gitea = Git2Source::new("/tmp").with_base_url("https://git.internal/");
        assert_eq!(gitea.resolve_url("a/b"), "https://git.internal/a/b.git");
    }

    #[tokio::test]
    async fn test_clone_branch_head() {
        let src = tempdir().unwrap();
        Repository::init(src.path()).unwrap();
        commit_file(src.path(), "a.txt", "one", "first");
        let head = commit_file(src.path(), "a.txt", "two", "second");

        let mount = tempdir().unwrap();
        let git = Git2Source::new(mount.path());
        let cloned = git.clone_repository(request(src.path(), "")).await.unwrap();
        assert_eq!(cloned.commit_hash, head);
        assert_eq!(fs::read_to_string(cloned.path.join("a.txt")).unwrap(), "two");
        assert!(cloned.path.starts_with(mount.path()));
    }

    #[tokio::test]
    async fn test_clone_pins_commit() {
        let src = tempdir().unwrap();
        Repository::init(src.path()).unwrap();
        let first = commit_file(src.path(), "a.txt", "one", "first");
        commit_file(src.path(), "a.txt", "two", "second");

        let mount = tempdir().unwrap();
        let git = Git2Source::new(mount.path());
        let cloned = git
            .clone_repository(request(src.path(), &first))
            .await
            .unwrap();
        assert_eq!(cloned.commit_hash, first);
        assert_eq!(fs::read_to_string(cloned.path.join("a.txt")).unwrap(), "one");
    }

    #[tokio::test]
    async fn test_clone_unknown_commit_fails() {
        let src = tempdir().unwrap();
        Repository::init(src.path()).unwrap();
        commit_file(src.path(), "a.txt", "one", "first");
        let mount = tempdir().unwrap();
        let git = Git2Source::new(mount.path());
        let err = git
            .clone_repository(request(src.path(), "0123456789012345678901234567890123456789"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("not found"));
    }

    #[tokio::test]
    async fn test_remove_repository_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("repo");
        fs::create_dir_all(target.join("sub")).unwrap();
        let git = Git2Source::new(dir.path());
        git.remove_repository(&target).await.unwrap();
        assert!(!target.exists());
        git.remove_repository(&target).await.unwrap();
    }
}
