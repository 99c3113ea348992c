//! Version-control helper.
//!
//! Thin async wrappers over the `git` binary scoped to one working tree.
//! The daemon uses this for three things: snapshotting pending changes
//! around a coder turn, producing per-file textual diffs for remote review,
//! and serving commit history to clients. Everything shells out; no libgit
//! binding is linked.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("no commits found")]
    NoCommits,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitStats {
    pub additions: u32,
    pub deletions: u32,
    pub files_changed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Short hash as printed by `%h`.
    pub hash: String,
    pub full_hash: String,
    /// First line of the commit message.
    pub message: String,
    pub full_message: String,
    pub author: String,
    pub email: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub stats: CommitStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDetails {
    #[serde(flatten)]
    pub info: CommitInfo,
    pub files: Vec<FileChange>,
}

const LOG_FORMAT: &str = "%h|%H|%s|%b|%an|%ae|%at";

pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// One working tree.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
}

impl Repository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<Output, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .await?;
        Ok(output)
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Files with pending changes: modified against HEAD plus untracked.
    /// A missing HEAD (fresh repo) degrades to untracked-only.
    pub async fn detect_changed_files(&self) -> Result<Vec<String>, GitError> {
        let mut files = HashSet::new();

        match self.git(&["diff", "--name-only", "HEAD"]).await {
            Ok(output) if output.status.success() => {
                for line in String::from_utf8_lossy(&output.stdout).lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        files.insert(line.to_string());
                    }
                }
            }
            Ok(_) => debug!("git diff HEAD unavailable, likely an unborn branch"),
            Err(err) => return Err(err),
        }

        let untracked = self
            .git_ok(&["ls-files", "--others", "--exclude-standard"])
            .await?;
        for line in untracked.lines() {
            let line = line.trim();
            if !line.is_empty() {
                files.insert(line.to_string());
            }
        }

        Ok(files.into_iter().collect())
    }

    /// Textual diff for one file. Tracked files diff against the index/HEAD;
    /// untracked files get a synthetic new-file diff against the null device.
    /// Returns an empty string when there is nothing to show.
    pub async fn generate_diff(&self, file_path: &str) -> Result<String, GitError> {
        let tracked = !self
            .git_ok(&["ls-files", "--", file_path])
            .await?
            .trim()
            .is_empty();

        if !tracked {
            let untracked = self
                .git_ok(&["ls-files", "--others", "--exclude-standard", "--", file_path])
                .await?;
            if untracked.trim().is_empty() {
                return Ok(String::new());
            }
            // --no-index exits 1 when the files differ, which is the whole
            // point here, so only the spawn error matters.
            let output = self
                .git(&["diff", "--no-index", "--", "/dev/null", file_path])
                .await?;
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let mut diff = self.git_ok(&["diff", "--", file_path]).await?;
        if diff.is_empty() {
            diff = self.git_ok(&["diff", "HEAD", "--", file_path]).await?;
        }
        Ok(diff)
    }

    pub async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.git_ok(&["add", "-A"]).await?;
        self.git_ok(&["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn push(&self) -> Result<(), GitError> {
        self.git_ok(&["push"]).await?;
        Ok(())
    }

    /// Commits and then pushes if a remote is configured; a missing push
    /// destination is not an error.
    pub async fn commit_and_push(&self, message: &str) -> Result<(), GitError> {
        self.commit(message).await?;
        if let Err(err) = self.push().await {
            let text = err.to_string();
            if text.contains("No configured push destination")
                || text.contains("no upstream branch")
            {
                debug!("no remote configured, committed locally only");
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reverts one file: tracked files restore from HEAD, untracked files
    /// are removed from the tree.
    pub async fn discard_file(&self, file_path: &str) -> Result<(), GitError> {
        let tracked = !self
            .git_ok(&["ls-files", "--", file_path])
            .await?
            .trim()
            .is_empty();
        if tracked {
            self.git_ok(&["checkout", "HEAD", "--", file_path]).await?;
        } else {
            self.git_ok(&["clean", "-fd", "--", file_path]).await?;
        }
        Ok(())
    }

    pub async fn discard_all(&self) -> Result<(), GitError> {
        self.git_ok(&["reset", "--hard"]).await?;
        self.git_ok(&["clean", "-fd"]).await?;
        Ok(())
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .git_ok(&["branch", "--show-current"])
            .await?
            .trim()
            .to_string())
    }

    pub async fn head_hash(&self) -> Result<String, GitError> {
        Ok(self.git_ok(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    pub async fn commits(&self, limit: usize) -> Result<Vec<CommitInfo>, GitError> {
        let count = format!("-{limit}");
        let format = format!("--format={LOG_FORMAT}");
        let output = self
            .git_ok(&["log", &count, &format, "--shortstat", "--no-merges"])
            .await?;
        Ok(dedup_commits(parse_git_log(&output)))
    }

    /// Commits reachable from HEAD but not from `since_hash`, newest first.
    /// An unknown hash (history rewritten under us) falls back to the most
    /// recent `limit` commits.
    pub async fn commits_since(
        &self,
        since_hash: &str,
        limit: usize,
    ) -> Result<Vec<CommitInfo>, GitError> {
        if since_hash.is_empty() {
            return self.commits(limit).await;
        }
        let range = format!("{since_hash}..HEAD");
        let format = format!("--format={LOG_FORMAT}");
        match self
            .git_ok(&["log", &range, &format, "--shortstat", "--no-merges"])
            .await
        {
            Ok(output) => {
                let mut commits = dedup_commits(parse_git_log(&output));
                commits.truncate(limit);
                Ok(commits)
            }
            Err(_) => self.commits(limit).await,
        }
    }

    pub async fn latest_commit(&self) -> Result<CommitInfo, GitError> {
        self.commits(1).await?.into_iter().next().ok_or(GitError::NoCommits)
    }

    pub async fn commit_details(&self, hash: &str) -> Result<CommitDetails, GitError> {
        let format = format!("--format={LOG_FORMAT}");
        let output = self
            .git_ok(&["show", hash, &format, "--shortstat", "--no-patch"])
            .await?;
        let info = parse_git_log(&output)
            .into_iter()
            .next()
            .ok_or(GitError::NoCommits)?;

        let numstat = self.git_ok(&["show", hash, "--numstat", "--format="]).await?;
        let mut files = Vec::new();
        for line in numstat.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            // "-" marks binary files in numstat output.
            let additions = fields[0].parse().unwrap_or(0);
            let deletions = fields[1].parse().unwrap_or(0);
            let path = fields[2].to_string();

            let diff = match self.git_ok(&["show", hash, "--", &path]).await {
                Ok(diff) => diff,
                Err(err) => {
                    warn!("failed to get diff for {path}: {err}");
                    String::new()
                }
            };

            files.push(FileChange {
                path,
                additions,
                deletions,
                diff,
            });
        }

        Ok(CommitDetails { info, files })
    }
}

/// Creates a repository at `path` if one does not exist: `git init`, a
/// starter `.gitignore`, and a best-effort initial commit.
pub async fn ensure_git_repo(path: &Path) -> Result<(), GitError> {
    if is_git_repo(path) {
        return Ok(());
    }

    let repo = Repository::new(path);
    repo.git_ok(&["init"]).await?;

    let gitignore = path.join(".gitignore");
    if !gitignore.exists() {
        let default_ignore = "node_modules/\n__pycache__/\n.venv/\ndist/\nbuild/\n\
                              .idea/\n.vscode/\n.DS_Store\n.env\n.env.local\n*.log\n";
        if let Err(err) = std::fs::write(&gitignore, default_ignore) {
            warn!("failed to write .gitignore: {err}");
        }
    }

    // Both steps may legitimately find nothing to do in an empty folder.
    if let Err(err) = repo.git_ok(&["add", "-A"]).await {
        debug!("initial staging skipped: {err}");
    }
    if let Err(err) = repo.git_ok(&["commit", "-m", "Initial commit (Finn)"]).await {
        debug!("initial commit skipped: {err}");
    }

    Ok(())
}

fn dedup_commits(commits: Vec<CommitInfo>) -> Vec<CommitInfo> {
    let mut seen = HashSet::new();
    commits
        .into_iter()
        .filter(|c| seen.insert(c.full_hash.clone()))
        .collect()
}

/// Parses `git log --format=%h|%H|%s|%b|%an|%ae|%at --shortstat` output.
/// Commit lines are pipe-delimited; the following shortstat line, when
/// present, fills in the stats.
fn parse_git_log(output: &str) -> Vec<CommitInfo> {
    let mut commits: Vec<CommitInfo> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.contains('|') {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 7 {
                continue;
            }
            let subject = parts[2].to_string();
            let body = parts[3].trim();
            let full_message = if body.is_empty() {
                subject.clone()
            } else {
                format!("{subject}\n\n{body}")
            };
            commits.push(CommitInfo {
                hash: parts[0].to_string(),
                full_hash: parts[1].to_string(),
                message: subject,
                full_message,
                author: parts[4].to_string(),
                email: parts[5].to_string(),
                timestamp: parts[6].trim().parse().unwrap_or(0),
                stats: CommitStats::default(),
            });
        } else if line.contains("changed,") || line.contains("insertion") || line.contains("deletion")
        {
            if let Some(current) = commits.last_mut() {
                current.stats = parse_shortstat(line);
            }
        }
    }

    commits
}

fn parse_shortstat(line: &str) -> CommitStats {
    let mut stats = CommitStats::default();
    let fields: Vec<&str> = line.split_whitespace().collect();
    for (i, field) in fields.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let count = || fields[i - 1].parse().unwrap_or(0);
        if field.starts_with("file") {
            stats.files_changed = count();
        } else if field.starts_with("insertion") {
            stats.additions = count();
        } else if field.starts_with("deletion") {
            stats.deletions = count();
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_with_shortstat() {
        let output = "abc1234|abc1234def|Add feature|details here|Ada|ada@example.com|1700000000\n \
                      3 files changed, 45 insertions(+), 12 deletions(-)\n\
                      def5678|def5678abc|Fix bug||Bob|bob@example.com|1700000100\n \
                      1 file changed, 2 deletions(-)\n";

        let commits = parse_git_log(output);
        assert_eq!(commits.len(), 2);

        let first = &commits[0];
        assert_eq!(first.hash, "abc1234");
        assert_eq!(first.message, "Add feature");
        assert_eq!(first.full_message, "Add feature\n\ndetails here");
        assert_eq!(first.timestamp, 1_700_000_000);
        assert_eq!(first.stats.files_changed, 3);
        assert_eq!(first.stats.additions, 45);
        assert_eq!(first.stats.deletions, 12);

        let second = &commits[1];
        assert_eq!(second.full_message, "Fix bug");
        assert_eq!(second.stats.files_changed, 1);
        assert_eq!(second.stats.additions, 0);
        assert_eq!(second.stats.deletions, 2);
    }

    #[test]
    fn dedup_drops_repeated_hashes() {
        let output = "a|full-a|one||X|x@x|1\na|full-a|one||X|x@x|1\nb|full-b|two||X|x@x|2\n";
        let commits = dedup_commits(parse_git_log(output));
        assert_eq!(commits.len(), 2);
    }

    #[tokio::test]
    async fn repo_round_trip_detect_diff_commit_discard() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path();

        let run = |args: Vec<&str>| {
            let status = std::process::Command::new("git")
                .args(&args)
                .current_dir(path)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .status()
                .expect("spawn git");
            assert!(status.success(), "git {args:?}");
        };
        run(vec!["init", "-q"]);
        std::fs::write(path.join("base.txt"), "base\n").expect("write");
        run(vec!["add", "-A"]);
        run(vec!["-c", "user.name=test", "-c", "user.email=test@example.com", "commit", "-qm", "init"]);

        let repo = Repository::new(path);
        assert!(repo.detect_changed_files().await.expect("detect").is_empty());

        std::fs::write(path.join("new.txt"), "fresh content\n").expect("write new");
        std::fs::write(path.join("base.txt"), "base\nmore\n").expect("modify");

        let mut changed = repo.detect_changed_files().await.expect("detect");
        changed.sort();
        assert_eq!(changed, vec!["base.txt".to_string(), "new.txt".to_string()]);

        let new_diff = repo.generate_diff("new.txt").await.expect("diff new");
        assert!(new_diff.contains("fresh content"));
        assert!(new_diff.contains("/dev/null"));

        let mod_diff = repo.generate_diff("base.txt").await.expect("diff modified");
        assert!(mod_diff.contains("+more"));

        repo.discard_file("new.txt").await.expect("discard untracked");
        assert!(!path.join("new.txt").exists());
        repo.discard_file("base.txt").await.expect("discard tracked");
        assert_eq!(
            std::fs::read_to_string(path.join("base.txt")).expect("read"),
            "base\n"
        );

        assert!(repo.detect_changed_files().await.expect("detect").is_empty());
    }

    #[tokio::test]
    async fn ensure_git_repo_initializes_once() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("app.js"), "console.log(1)\n").expect("write");

        ensure_git_repo(dir.path()).await.expect("first init");
        assert!(is_git_repo(dir.path()));
        assert!(dir.path().join(".gitignore").exists());

        // Idempotent on a tree that is already a repository.
        ensure_git_repo(dir.path()).await.expect("second init");
    }
}
