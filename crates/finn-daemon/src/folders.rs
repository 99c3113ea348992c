//! Approved-folder management and filesystem browsing.
//!
//! The approved set is the sole authority for which paths the daemon may
//! touch. Adding is bounded by the subscription tier; removal cascades into
//! the watcher, the dev-server supervisor and any preview tunnel keyed by
//! the folder, but never touches the filesystem itself. Browsing is
//! clipped to the user's home subtree.

use crate::daemon::Daemon;
use finn_core::{
    msg, BrowseFoldersRequest, DirectoryEntry, FolderAddRequest, FolderRemoveRequest,
    FolderSelectRequest,
};
use finn_git::Repository;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".vscode",
    ".idea",
    "__pycache__",
    ".cache",
];

pub async fn handle_folder_add(daemon: &Arc<Daemon>, payload: Value) {
    let payload: FolderAddRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse folder_add payload: {err}");
            daemon.send_folder_response(false, "Invalid request", "").await;
            return;
        }
    };

    if payload.path.is_empty() {
        // The tray's native picker is the only other entry point; without
        // a UI the client must supply the path.
        daemon
            .send_folder_response(
                false,
                "No path supplied. Use 'Add by Path' to enter the folder path manually.",
                "",
            )
            .await;
        return;
    }

    let path = Path::new(&payload.path);
    if !path.exists() {
        daemon
            .send_folder_response(false, &format!("Folder does not exist: {}", payload.path), "")
            .await;
        return;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| payload.path.clone());

    let added = {
        let mut cfg = daemon.cfg.lock().await;
        match cfg.add_folder(&name, &payload.path) {
            Ok(folder) => {
                if let Err(err) = cfg.save() {
                    warn!("failed to save config: {err}");
                    daemon
                        .send_folder_response(false, &format!("Failed to save: {err}"), "")
                        .await;
                    return;
                }
                daemon.refresh_approved_paths(&cfg);
                info!(
                    event = "folder_approved",
                    name = %name,
                    count = cfg.approved_folders.len(),
                    max = cfg.subscription.max_folders
                );
                folder
            }
            Err(err) => {
                warn!("folder add rejected: {err}");
                daemon.send_folder_response(false, &err.to_string(), "").await;
                return;
            }
        }
    };

    daemon
        .send_folder_response(true, "Folder added successfully", &added.id)
        .await;
    daemon.send_folder_list().await;

    // Batch-discover any coder sessions that already exist for this
    // folder.
    let watcher = daemon.watcher.lock().expect("watcher lock").clone();
    if let Some(watcher) = watcher {
        let sessions = watcher.scan_project(&payload.path);
        if !sessions.is_empty() {
            crate::sessions::send_sessions_batch(daemon, &sessions, &payload.path).await;
        }
    }
}

pub async fn handle_folder_remove(daemon: &Arc<Daemon>, payload: Value) {
    let payload: FolderRemoveRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse folder_remove payload: {err}");
            daemon.send_folder_response(false, "Invalid request", "").await;
            return;
        }
    };

    let removed = {
        let mut cfg = daemon.cfg.lock().await;
        match cfg.remove_folder_by_id(&payload.folder_id) {
            Ok(folder) => {
                if let Err(err) = cfg.save() {
                    warn!("failed to save config: {err}");
                }
                daemon.refresh_approved_paths(&cfg);
                folder
            }
            Err(err) => {
                daemon.send_folder_response(false, &err.to_string(), "").await;
                return;
            }
        }
    };
    info!(event = "folder_removed", folder_id = %payload.folder_id);

    // Cascade: watcher state, dev server and tunnel keyed by this folder
    // all go; the files on disk stay untouched.
    let watcher = daemon.watcher.lock().expect("watcher lock").clone();
    if let Some(watcher) = watcher {
        watcher.clear_project(&removed.path);
    }
    daemon.dev_servers.stop(&payload.folder_id).await;
    let tunnel = daemon.tunnels.lock().await.remove(&payload.folder_id);
    if let Some(tunnel) = tunnel {
        tunnel.close().await;
    }

    daemon
        .send_folder_response(true, "Folder removed successfully", "")
        .await;
    daemon.send_folder_list().await;
}

pub async fn handle_folder_select(daemon: &Arc<Daemon>, payload: Value) {
    let payload: FolderSelectRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse folder_select payload: {err}");
            daemon.send_folder_response(false, "Invalid request", "").await;
            return;
        }
    };

    {
        let mut cfg = daemon.cfg.lock().await;
        if let Err(err) = cfg.select_folder(&payload.folder_id) {
            daemon.send_folder_response(false, &err.to_string(), "").await;
            return;
        }
        if let Err(err) = cfg.save() {
            warn!("failed to save config: {err}");
            daemon
                .send_folder_response(false, &format!("Failed to save: {err}"), "")
                .await;
            return;
        }
    }

    info!(event = "folder_selected", folder_id = %payload.folder_id);
    daemon
        .send_folder_response(true, "Folder selected successfully", &payload.folder_id)
        .await;
    daemon.send_folder_list().await;
}

/// Lists directories for the client's folder picker; only the home
/// subtree is reachable.
pub async fn handle_browse_folders(daemon: &Arc<Daemon>, payload: Value) {
    let payload: BrowseFoldersRequest = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse browse_folders payload: {err}");
            daemon.send_browse_response("", Vec::new(), "Invalid request").await;
            return;
        }
    };

    let home = match finn_config::home_dir() {
        Ok(home) => home,
        Err(err) => {
            daemon
                .send_browse_response("", Vec::new(), &err.to_string())
                .await;
            return;
        }
    };

    let browse_path = if payload.path.is_empty() {
        home.clone()
    } else {
        PathBuf::from(&payload.path)
    };

    let resolved = match clip_to_home(&browse_path, &home) {
        Ok(resolved) => resolved,
        Err(message) => {
            warn!("browse rejected: {message}");
            daemon.send_browse_response("", Vec::new(), &message).await;
            return;
        }
    };

    if !resolved.is_dir() {
        daemon
            .send_browse_response("", Vec::new(), "Path is not a directory")
            .await;
        return;
    }

    let entries = match std::fs::read_dir(&resolved) {
        Ok(entries) => entries,
        Err(err) => {
            daemon
                .send_browse_response("", Vec::new(), &format!("Failed to read directory: {err}"))
                .await;
            return;
        }
    };

    let mut directories = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        if entry.path().is_dir() {
            directories.push(DirectoryEntry {
                name,
                path: entry.path().to_string_lossy().to_string(),
                is_dir: true,
            });
        }
    }
    directories.sort_by(|a, b| a.name.cmp(&b.name));

    daemon
        .send_browse_response(&resolved.to_string_lossy(), directories, "")
        .await;
}

/// Canonicalizes and verifies containment in the home directory; `..`
/// segments cannot escape.
fn clip_to_home(requested: &Path, home: &Path) -> Result<PathBuf, String> {
    let resolved = requested
        .canonicalize()
        .map_err(|_| format!("Path does not exist: {}", requested.display()))?;
    let home = home
        .canonicalize()
        .map_err(|_| "Failed to resolve home directory".to_string())?;
    if !resolved.starts_with(&home) {
        return Err("Access denied: can only browse within your home directory".to_string());
    }
    Ok(resolved)
}

impl Daemon {
    pub async fn send_folder_response(&self, success: bool, message: &str, folder_id: &str) {
        let status = if success { "success" } else { "error" };
        self.send(
            msg::FOLDER_RESPONSE,
            json!({
                "status": status,
                "message": message,
                "folder_id": folder_id,
            }),
        )
        .await;
    }

    pub async fn send_browse_response(
        &self,
        current_path: &str,
        directories: Vec<DirectoryEntry>,
        error: &str,
    ) {
        let status = if error.is_empty() { "success" } else { "error" };
        self.send(
            msg::FOLDER_BROWSE_RESPONSE,
            json!({
                "status": status,
                "current_path": current_path,
                "directories": directories,
                "error": error,
            }),
        )
        .await;
    }

    /// Ships the approved-folder list (with per-folder branch and recent
    /// commits, when the folder is a repository) to the dashboard.
    pub async fn send_folder_list(&self) {
        let (folders, selected) = {
            let cfg = self.cfg.lock().await;
            (cfg.approved_folders.clone(), cfg.selected_folder_id.clone())
        };

        let mut folder_data = Vec::with_capacity(folders.len());
        for folder in &folders {
            let path = Path::new(&folder.path);
            let is_git_repo = finn_git::is_git_repo(path);
            let mut entry = json!({
                "id": folder.id,
                "name": folder.name,
                "path": folder.path,
                "is_git_repo": is_git_repo,
            });

            if is_git_repo {
                let repo = Repository::new(path);
                if let Ok(branch) = repo.current_branch().await {
                    if !branch.is_empty() {
                        entry["current_branch"] = json!(branch);
                    }
                }
                if let Ok(commits) = repo.commits(50).await {
                    if !commits.is_empty() {
                        entry["commits"] = json!(crate::git_sync::commits_payload(&commits));
                    }
                }
            }

            folder_data.push(entry);
        }

        self.send(
            msg::FOLDER_LIST,
            json!({
                "folders": folder_data,
                "selected_folder_id": selected,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn clip_to_home_accepts_subdirectories() {
        let home = TempDir::new().expect("home");
        let sub = home.path().join("projects");
        std::fs::create_dir(&sub).expect("mkdir");

        let resolved = clip_to_home(&sub, home.path()).expect("inside home");
        assert!(resolved.ends_with("projects"));
    }

    #[test]
    fn clip_to_home_rejects_escapes() {
        let home = TempDir::new().expect("home");
        let outside = TempDir::new().expect("outside");

        let err = clip_to_home(outside.path(), home.path()).expect_err("outside home");
        assert!(err.contains("Access denied"));

        // Dot-dot traversal resolves before the check, so it cannot slip
        // through.
        let sneaky = home.path().join("..");
        assert!(clip_to_home(&sneaky, home.path()).is_err());
    }

    #[test]
    fn clip_to_home_reports_missing_paths() {
        let home = TempDir::new().expect("home");
        let missing = home.path().join("nope");
        let err = clip_to_home(&missing, home.path()).expect_err("missing");
        assert!(err.contains("does not exist"));
    }
}
