//! Git handlers and the background commit-sync checker.
//!
//! Clients can ask for history on demand; the checker also watches every
//! approved repository's HEAD on a 30 s cadence and pushes new commits to
//! the relay so dashboards stay current without polling the daemon.

use crate::daemon::Daemon;
use finn_core::{msg, GetCommitDetailRequest, GetCommitsRequest, GitInitRequest, RequestCommitSync};
use finn_git::{CommitInfo, Repository};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const SYNC_STARTUP_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_COMMIT_LIMIT: usize = 50;

pub async fn handle_git_init(daemon: &Arc<Daemon>, payload: Value) {
    let payload: GitInitRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse git_init payload: {err}");
            return;
        }
    };

    let Some(folder) = daemon.resolve_folder(&payload.folder_id, None).await else {
        daemon
            .send_git_init_response(&payload.folder_id, false, "Folder not found")
            .await;
        return;
    };

    let path = Path::new(&folder.path);
    if finn_git::is_git_repo(path) {
        daemon
            .send_git_init_response(&payload.folder_id, true, "Already a git repository")
            .await;
        daemon.send_folder_list().await;
        return;
    }

    if let Err(err) = finn_git::ensure_git_repo(path).await {
        daemon
            .send_git_init_response(
                &payload.folder_id,
                false,
                &format!("Failed to initialize git: {err}"),
            )
            .await;
        return;
    }

    info!(event = "git_initialized", folder_id = %payload.folder_id);
    daemon
        .send_git_init_response(&payload.folder_id, true, "Git repository initialized successfully")
        .await;
    daemon.send_folder_list().await;
}

pub async fn handle_get_commits(daemon: &Arc<Daemon>, payload: Value) {
    let payload: GetCommitsRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse get_commits payload: {err}");
            return;
        }
    };
    let limit = if payload.limit == 0 {
        DEFAULT_COMMIT_LIMIT
    } else {
        payload.limit
    };

    let Some(folder) = daemon.resolve_folder(&payload.folder_id, None).await else {
        daemon
            .send_commits_error(&payload.folder_id, "Folder not found")
            .await;
        return;
    };
    let path = Path::new(&folder.path);
    if !finn_git::is_git_repo(path) {
        daemon
            .send_commits_error(&payload.folder_id, "Not a git repository")
            .await;
        return;
    }

    match Repository::new(path).commits(limit).await {
        Ok(commits) => {
            self::send_commits_list(daemon, &payload.folder_id, &commits).await;
        }
        Err(err) => {
            daemon
                .send_commits_error(&payload.folder_id, &format!("Failed to get commits: {err}"))
                .await;
        }
    }
}

pub async fn handle_get_commit_detail(daemon: &Arc<Daemon>, payload: Value) {
    let payload: GetCommitDetailRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse get_commit_detail payload: {err}");
            return;
        }
    };

    let Some(folder) = daemon.resolve_folder(&payload.folder_id, None).await else {
        daemon
            .send(
                msg::COMMIT_DETAIL,
                json!({
                    "folder_id": payload.folder_id,
                    "commit_hash": payload.commit_hash,
                    "error": "Folder not found",
                }),
            )
            .await;
        return;
    };

    match Repository::new(&folder.path).commit_details(&payload.commit_hash).await {
        Ok(detail) => {
            daemon
                .send(
                    msg::COMMIT_DETAIL,
                    json!({
                        "folder_id": payload.folder_id,
                        "commit_hash": detail.info.full_hash,
                        "short_hash": detail.info.hash,
                        "message": detail.info.message,
                        "author": detail.info.author,
                        "author_email": detail.info.email,
                        "committed_at": committed_at(&detail.info),
                        "additions": detail.info.stats.additions,
                        "deletions": detail.info.stats.deletions,
                        "files_changed": detail.info.stats.files_changed,
                        "files": detail.files,
                    }),
                )
                .await;
        }
        Err(err) => {
            daemon
                .send(
                    msg::COMMIT_DETAIL,
                    json!({
                        "folder_id": payload.folder_id,
                        "commit_hash": payload.commit_hash,
                        "error": format!("Failed to get commit: {err}"),
                    }),
                )
                .await;
        }
    }
}

/// Immediate re-sync on client demand, optionally scoped to one folder.
pub async fn handle_request_commit_sync(daemon: &Arc<Daemon>, payload: Value) {
    let payload: RequestCommitSync = serde_json::from_value(payload).unwrap_or(RequestCommitSync {
        folder_id: String::new(),
    });

    let folders = {
        let cfg = daemon.cfg.lock().await;
        cfg.approved_folders.clone()
    };

    let mut folders_count = 0usize;
    let mut commits_count = 0usize;
    for folder in &folders {
        if !payload.folder_id.is_empty() && folder.id != payload.folder_id {
            continue;
        }
        folders_count += 1;

        let path = Path::new(&folder.path);
        if !finn_git::is_git_repo(path) {
            continue;
        }
        match Repository::new(path).commits(DEFAULT_COMMIT_LIMIT).await {
            Ok(commits) if !commits.is_empty() => {
                send_sync_commits(daemon, &folder.id, &commits).await;
                commits_count += commits.len();
            }
            Ok(_) => {}
            Err(err) => warn!("failed to get commits for {}: {err}", folder.name),
        }
    }

    daemon
        .send(
            msg::COMMIT_SYNC_COMPLETE,
            json!({
                "folder_id": payload.folder_id,
                "folders_count": folders_count,
                "commits_count": commits_count,
            }),
        )
        .await;
}

impl Daemon {
    /// Periodic HEAD watcher over the approved set.
    pub fn spawn_git_sync_checker(&self) {
        let Some(daemon) = self.weak.upgrade() else { return };
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(SYNC_STARTUP_DELAY) => {}
            }
            daemon.check_git_changes().await;

            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => {}
                }
                daemon.check_git_changes().await;
            }
        });
    }

    async fn check_git_changes(&self) {
        if !self.relay.is_connected() {
            return;
        }
        let folders = {
            let cfg = self.cfg.lock().await;
            cfg.approved_folders.clone()
        };
        for folder in folders {
            let path = Path::new(&folder.path);
            if !finn_git::is_git_repo(path) {
                continue;
            }
            self.check_folder_head(&folder.id, path).await;
        }
    }

    async fn check_folder_head(&self, folder_id: &str, path: &Path) {
        let repo = Repository::new(path);
        let Ok(current_head) = repo.head_hash().await else {
            return;
        };

        let last_head = {
            let heads = self.last_heads.lock().await;
            heads.get(folder_id).cloned()
        };

        let Some(last_head) = last_head else {
            self.last_heads
                .lock()
                .await
                .insert(folder_id.to_string(), current_head);
            return;
        };
        if last_head == current_head {
            return;
        }

        info!(
            event = "head_changed",
            folder_id = folder_id,
            from = %&last_head[..7.min(last_head.len())],
            to = %&current_head[..7.min(current_head.len())]
        );

        match repo.commits_since(&last_head, DEFAULT_COMMIT_LIMIT).await {
            Ok(commits) if !commits.is_empty() => {
                send_sync_commits(self, folder_id, &commits).await;
            }
            Ok(_) => {}
            Err(err) => warn!("failed to get new commits for {folder_id}: {err}"),
        }

        self.last_heads
            .lock()
            .await
            .insert(folder_id.to_string(), current_head);
    }

    async fn send_git_init_response(&self, folder_id: &str, success: bool, message: &str) {
        self.send(
            msg::GIT_INIT_RESPONSE,
            json!({
                "folder_id": folder_id,
                "success": success,
                "message": message,
            }),
        )
        .await;
    }

    async fn send_commits_error(&self, folder_id: &str, message: &str) {
        self.send(
            msg::COMMITS_LIST,
            json!({
                "folder_id": folder_id,
                "error": message,
                "commits": [],
            }),
        )
        .await;
    }
}

async fn send_commits_list(daemon: &Daemon, folder_id: &str, commits: &[CommitInfo]) {
    daemon
        .send(
            msg::COMMITS_LIST,
            json!({
                "folder_id": folder_id,
                "commits": commits_payload(commits),
            }),
        )
        .await;
}

async fn send_sync_commits(daemon: &Daemon, folder_id: &str, commits: &[CommitInfo]) {
    daemon
        .send(
            msg::SYNC_COMMITS,
            json!({
                "folder_id": folder_id,
                "commits": commits_payload(commits),
            }),
        )
        .await;
}

/// Announces the commit that settled a conversation's approved diff set.
pub async fn send_commit_success(
    daemon: &Daemon,
    conversation_id: &str,
    folder_id: &str,
    repo: &Repository,
) {
    let commit = match repo.latest_commit().await {
        Ok(commit) => commit,
        Err(err) => {
            warn!("could not load latest commit for success message: {err}");
            return;
        }
    };

    daemon
        .send(
            msg::COMMIT_SUCCESS,
            json!({
                "conversation_id": conversation_id,
                "folder_id": folder_id,
                "commit_hash": commit.full_hash,
                "short_hash": commit.hash,
                "message": commit.message,
                "author": commit.author,
                "author_email": commit.email,
                "committed_at": committed_at(&commit),
                "additions": commit.stats.additions,
                "deletions": commit.stats.deletions,
                "files_changed": commit.stats.files_changed,
            }),
        )
        .await;

    // Dashboards key off the folder list for history; refresh it.
    daemon.send_folder_list().await;
}

pub fn commits_payload(commits: &[CommitInfo]) -> Vec<Value> {
    commits
        .iter()
        .map(|commit| {
            json!({
                "commit_hash": commit.full_hash,
                "short_hash": commit.hash,
                "message": commit.message,
                "author": commit.author,
                "author_email": commit.email,
                "committed_at": committed_at(commit),
                "additions": commit.stats.additions,
                "deletions": commit.stats.deletions,
                "files_changed": commit.stats.files_changed,
            })
        })
        .collect()
}

fn committed_at(commit: &CommitInfo) -> String {
    chrono::DateTime::from_timestamp(commit.timestamp, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use finn_git::CommitStats;

    #[test]
    fn commits_payload_shapes_wire_fields() {
        let commits = vec![CommitInfo {
            hash: "abc1234".into(),
            full_hash: "abc1234def5678".into(),
            message: "Add feature".into(),
            full_message: "Add feature\n\nbody".into(),
            author: "Ada".into(),
            email: "ada@example.com".into(),
            timestamp: 1_700_000_000,
            stats: CommitStats {
                additions: 10,
                deletions: 2,
                files_changed: 3,
            },
        }];

        let payload = commits_payload(&commits);
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0]["short_hash"], "abc1234");
        assert_eq!(payload[0]["commit_hash"], "abc1234def5678");
        assert_eq!(payload[0]["additions"], 10);
        let committed_at = payload[0]["committed_at"].as_str().expect("timestamp");
        assert!(committed_at.starts_with("2023-11-14T"));
    }
}
