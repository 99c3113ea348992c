//! Session-log watcher.
//!
//! Tails the coder's append-only per-session logs under its projects root
//! and keeps an in-memory index of session metadata. Two producers feed the
//! index: a kernel-notify subscriber on the root and its project
//! subdirectories, and a 2 s poller that re-checks tracked files for growth
//! and sweeps for files notify missed. Only sessions whose decoded project
//! path passes the authorization filter are ever read; everything else is
//! skipped before the first byte. Metadata updates are debounced per
//! session so a burst of appended lines costs one callback.

use chrono::{DateTime, Utc};
use finn_coder::stored::StoredMessage;
use finn_coder::{decode_project_path, encode_project_path, USER_REQUEST_MARKER};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const UPDATE_DEBOUNCE: Duration = Duration::from_millis(500);
const SESSION_LOG_EXT: &str = "jsonl";
/// Subagent runs; never user-facing sessions.
const SUBAGENT_PREFIX: &str = "agent-";
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("coder sessions root not resolvable")]
    NoSessionsRoot,
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Activity within the last hour.
    Active,
    /// No activity for one to twenty-four hours.
    Inactive,
    /// No activity for a day or more.
    Stale,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_path: String,
    pub file_path: PathBuf,
    pub title: String,
    pub model: String,
    pub message_count: u64,
    pub total_cost_usd: f64,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    pub fn status(&self) -> SessionStatus {
        let elapsed = Utc::now().signed_duration_since(self.last_activity);
        if elapsed < chrono::Duration::hours(1) {
            SessionStatus::Active
        } else if elapsed < chrono::Duration::hours(24) {
            SessionStatus::Inactive
        } else {
            SessionStatus::Stale
        }
    }

    pub fn is_recently_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }
}

pub type SessionCallback = Arc<dyn Fn(SessionInfo) + Send + Sync>;
pub type SessionEndCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type WatchFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SessionCallbacks {
    pub on_new_session: Option<SessionCallback>,
    pub on_session_updated: Option<SessionCallback>,
    pub on_session_end: Option<SessionEndCallback>,
    /// Authorization filter; a project path it rejects is never tailed.
    pub should_watch: WatchFilter,
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self {
            on_new_session: None,
            on_session_updated: None,
            on_session_end: None,
            should_watch: Arc::new(|_| true),
        }
    }
}

/// One lock guards the index, the byte offsets and the debounce timers.
#[derive(Default)]
struct Index {
    sessions: HashMap<String, SessionInfo>,
    positions: HashMap<PathBuf, u64>,
    debounce: HashMap<String, JoinHandle<()>>,
}

pub struct SessionWatcher {
    root: PathBuf,
    callbacks: SessionCallbacks,
    index: Mutex<Index>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    stop: watch::Sender<bool>,
    /// Self-handle for the poller, the notify bridge and debounce timers.
    weak: Weak<SessionWatcher>,
}

impl SessionWatcher {
    pub fn new(callbacks: SessionCallbacks) -> Result<Arc<Self>, WatcherError> {
        let root = finn_coder::sessions_root().ok_or(WatcherError::NoSessionsRoot)?;
        Self::with_root(root, callbacks)
    }

    /// Watches an explicit root; the production root comes from the coder
    /// crate.
    pub fn with_root(
        root: PathBuf,
        callbacks: SessionCallbacks,
    ) -> Result<Arc<Self>, WatcherError> {
        std::fs::create_dir_all(&root)?;
        let (stop, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|weak| Self {
            root,
            callbacks,
            index: Mutex::new(Index::default()),
            fs_watcher: Mutex::new(None),
            stop,
            weak: weak.clone(),
        }))
    }

    /// Indexes what already exists (without broadcasting), then starts the
    /// notify subscriber and the backup poller.
    pub fn start(&self) {
        self.scan_existing_sessions();

        if let Err(err) = self.spawn_notify() {
            warn!("kernel notify unavailable, poll-only mode: {err}");
        }

        let Some(watcher) = self.weak.upgrade() else { return };
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => {}
                }
                watcher.poll_for_changes();
            }
        });

        info!(event = "watcher_started", root = %self.root.display());
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
        self.fs_watcher.lock().expect("watcher lock").take();
        let mut index = self.index.lock().expect("index lock");
        for (_, timer) in index.debounce.drain() {
            timer.abort();
        }
        info!(event = "watcher_stopped");
    }

    fn spawn_notify(&self) -> Result<(), WatcherError> {
        let (tx, mut rx) = mpsc::channel::<notify::Event>(256);
        let mut fs_watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(err) => warn!("notify error: {err}"),
            }
        })?;

        fs_watcher.watch(&self.root, RecursiveMode::NonRecursive)?;
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Err(err) = fs_watcher.watch(&entry.path(), RecursiveMode::NonRecursive) {
                        warn!("failed to watch {}: {err}", entry.path().display());
                    }
                }
            }
        }
        *self.fs_watcher.lock().expect("watcher lock") = Some(fs_watcher);

        let Some(watcher) = self.weak.upgrade() else {
            return Ok(());
        };
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.changed() => return,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                watcher.handle_notify_event(event);
            }
        });

        Ok(())
    }

    fn handle_notify_event(&self, event: notify::Event) {
        use notify::EventKind;
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    if path.is_dir() {
                        // A new project directory appeared; tail it too.
                        let mut guard = self.fs_watcher.lock().expect("watcher lock");
                        if let Some(fs_watcher) = guard.as_mut() {
                            if let Err(err) = fs_watcher.watch(path, RecursiveMode::NonRecursive) {
                                warn!("failed to watch {}: {err}", path.display());
                            }
                        }
                    } else if is_session_log(path) {
                        self.handle_new_file(path, true);
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    if is_session_log(path) {
                        self.handle_file_modified(path);
                    }
                }
            }
            _ => {}
        }
    }

    /// Backup for lost notify events: grown files are re-read, new files
    /// are picked up.
    fn poll_for_changes(&self) {
        let positions: Vec<(PathBuf, u64)> = {
            let index = self.index.lock().expect("index lock");
            index.positions.iter().map(|(p, o)| (p.clone(), *o)).collect()
        };

        for (path, position) in positions {
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.len() > position {
                    self.read_new_lines(&path, position);
                }
            }
        }

        self.scan_for_new_sessions();
    }

    fn scan_existing_sessions(&self) {
        let mut indexed = 0usize;
        let mut total = 0usize;
        for path in self.all_session_logs() {
            total += 1;
            if self.handle_new_file(&path, false) {
                indexed += 1;
            }
        }
        info!(
            event = "sessions_indexed",
            indexed = indexed,
            skipped = total - indexed
        );
    }

    fn scan_for_new_sessions(&self) {
        for path in self.all_session_logs() {
            let session_id = session_id_of(&path);
            let tracked = {
                let index = self.index.lock().expect("index lock");
                index.sessions.contains_key(&session_id)
            };
            if !tracked {
                self.handle_new_file(&path, true);
            }
        }
    }

    fn all_session_logs(&self) -> Vec<PathBuf> {
        let mut logs = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return logs;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(entry.path()) else {
                continue;
            };
            for file in files.flatten() {
                if is_session_log(&file.path()) {
                    logs.push(file.path());
                }
            }
        }
        logs
    }

    /// Tracks a session log discovered on disk. Returns false when the file
    /// was filtered out or already tracked. `broadcast` distinguishes live
    /// discoveries from the startup scan.
    fn handle_new_file(&self, path: &Path, broadcast: bool) -> bool {
        let session_id = session_id_of(path);
        if session_id.starts_with(SUBAGENT_PREFIX) {
            return false;
        }

        let encoded = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let project_path = decode_project_path(&encoded);

        // The authorization filter runs before any file work.
        if !(self.callbacks.should_watch)(&project_path) {
            return false;
        }

        let session = {
            let mut index = self.index.lock().expect("index lock");
            if index.sessions.contains_key(&session_id) {
                return false;
            }
            let session = build_session(&session_id, &project_path, path);
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            index.positions.insert(path.to_path_buf(), size);
            index.sessions.insert(session_id.clone(), session.clone());
            session
        };

        if broadcast {
            info!(
                event = "session_detected",
                session_id = %session.session_id,
                messages = session.message_count
            );
            if let Some(on_new) = &self.callbacks.on_new_session {
                on_new(session);
            }
        }
        true
    }

    fn handle_file_modified(&self, path: &Path) {
        // Only files already admitted by the filter are tailed; anything
        // else stays invisible no matter how often it is written.
        let position = {
            let index = self.index.lock().expect("index lock");
            match index.positions.get(path) {
                Some(position) => *position,
                None => return,
            }
        };
        self.read_new_lines(path, position);
    }

    /// Reads complete lines from `start` and folds them into the session's
    /// aggregates. The recorded offset only ever moves forward, and never
    /// past the last complete line.
    fn read_new_lines(&self, path: &Path, start: u64) {
        let Ok(mut file) = std::fs::File::open(path) else {
            return;
        };
        if file.seek(SeekFrom::Start(start)).is_err() {
            return;
        }
        let mut buffer = String::new();
        if file.read_to_string(&mut buffer).is_err() {
            return;
        }

        let consumed = match buffer.rfind('\n') {
            Some(last_newline) => last_newline as u64 + 1,
            None => return, // only a partial line so far
        };
        let complete = &buffer[..consumed as usize];

        let session_id = session_id_of(path);
        let mut records = Vec::new();
        for line in complete.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredMessage>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("failed to parse session record: {err}"),
            }
        }

        let processed = records.len();
        {
            let mut index = self.index.lock().expect("index lock");
            if let Some(session) = index.sessions.get_mut(&session_id) {
                for record in &records {
                    apply_record(session, record);
                }
                session.last_activity = Utc::now();
            }
            if let Some(position) = index.positions.get_mut(path) {
                *position = start + consumed;
            }
        }

        if processed > 0 {
            self.schedule_session_update(&session_id);
        }
    }

    /// Arms (or re-arms) the per-session debounce timer; the update
    /// callback fires once 500 ms after the last append.
    fn schedule_session_update(&self, session_id: &str) {
        let Some(watcher) = self.weak.upgrade() else { return };
        let id = session_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(UPDATE_DEBOUNCE).await;
            watcher.send_session_update(&id);
        });

        let mut index = self.index.lock().expect("index lock");
        if let Some(previous) = index.debounce.insert(session_id.to_string(), timer) {
            previous.abort();
        }
    }

    fn send_session_update(&self, session_id: &str) {
        let session = {
            let mut index = self.index.lock().expect("index lock");
            index.debounce.remove(session_id);
            match index.sessions.get(session_id) {
                Some(session) => session.clone(),
                None => return,
            }
        };
        if let Some(on_updated) = &self.callbacks.on_session_updated {
            on_updated(session);
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.index
            .lock()
            .expect("index lock")
            .sessions
            .get(session_id)
            .cloned()
    }

    pub fn get_sessions(&self) -> Vec<SessionInfo> {
        self.index
            .lock()
            .expect("index lock")
            .sessions
            .values()
            .cloned()
            .collect()
    }

    /// Full read of one session's records, for on-demand message queries.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, WatcherError> {
        let Some(session) = self.get_session(session_id) else {
            return Ok(Vec::new());
        };
        let data = std::fs::read_to_string(&session.file_path)?;
        Ok(data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Batch-discovers every session of one project folder. Holds the
    /// index lock end-to-end so the poller cannot race the scan.
    pub fn scan_project(&self, project_path: &str) -> Vec<SessionInfo> {
        let project_dir = self.root.join(encode_project_path(project_path));
        let Ok(files) = std::fs::read_dir(&project_dir) else {
            debug!("no session dir for {project_path}");
            return Vec::new();
        };

        let mut index = self.index.lock().expect("index lock");
        let mut discovered = Vec::new();

        for file in files.flatten() {
            let path = file.path();
            if !is_session_log(&path) {
                continue;
            }
            let session_id = session_id_of(&path);
            if session_id.starts_with(SUBAGENT_PREFIX)
                || index.sessions.contains_key(&session_id)
            {
                continue;
            }

            let session = build_session(&session_id, project_path, &path);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            index.positions.insert(path.clone(), size);
            index.sessions.insert(session_id, session.clone());
            discovered.push(session);
        }

        if !discovered.is_empty() {
            info!(
                event = "project_scanned",
                project = project_path,
                sessions = discovered.len()
            );
        }
        discovered
    }

    /// Drops every session under a path, cancelling pending debounce
    /// timers; called when a folder leaves the approved set. Fires
    /// `on_session_end` per dropped session.
    pub fn clear_project(&self, project_path: &str) -> usize {
        let ended: Vec<String> = {
            let mut index = self.index.lock().expect("index lock");
            let ids: Vec<String> = index
                .sessions
                .iter()
                .filter(|(_, s)| s.project_path == project_path)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(session) = index.sessions.remove(id) {
                    index.positions.remove(&session.file_path);
                }
                if let Some(timer) = index.debounce.remove(id) {
                    timer.abort();
                }
            }
            ids
        };

        if !ended.is_empty() {
            info!(
                event = "project_cleared",
                project = project_path,
                sessions = ended.len()
            );
        }
        for id in &ended {
            if let Some(on_end) = &self.callbacks.on_session_end {
                on_end(id.clone());
            }
        }
        ended.len()
    }
}

fn is_session_log(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SESSION_LOG_EXT)
}

fn session_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Parses the whole file once to seed counts, cost, model, title and last
/// activity for a newly tracked session.
fn build_session(session_id: &str, project_path: &str, path: &Path) -> SessionInfo {
    let mut session = SessionInfo {
        session_id: session_id.to_string(),
        project_path: project_path.to_string(),
        file_path: path.to_path_buf(),
        title: String::new(),
        model: String::new(),
        message_count: 0,
        total_cost_usd: 0.0,
        last_activity: DateTime::<Utc>::MIN_UTC,
    };

    let mut first_user_text = String::new();
    let mut first_assistant_text = String::new();
    let mut any_text = String::new();

    if let Ok(data) = std::fs::read_to_string(path) {
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<StoredMessage>(line) else {
                continue;
            };

            session.message_count += 1;
            session.total_cost_usd += record.cost_usd;

            let text = record.text_content();
            if first_user_text.is_empty() && record.kind == "user" && !text.is_empty() {
                first_user_text = text.clone();
            }
            if first_assistant_text.is_empty() && record.kind == "assistant" && !text.is_empty() {
                first_assistant_text = text.clone();
            }
            if any_text.is_empty() && !text.is_empty() {
                any_text = text.clone();
            }

            if record.kind == "summary" && !record.summary.is_empty() {
                session.title = record.summary.clone();
            }
            if let Some(model) = record.model() {
                session.model = model;
            }
            if let Some(timestamp) = record.timestamp {
                if timestamp > session.last_activity {
                    session.last_activity = timestamp;
                }
            }
        }
    }

    // Title fallback chain: summary, first user text, first assistant
    // text, anything with content.
    if session.title.is_empty() {
        let source = if !first_user_text.is_empty() {
            &first_user_text
        } else if !first_assistant_text.is_empty() {
            &first_assistant_text
        } else {
            &any_text
        };
        if !source.is_empty() {
            session.title = title_from_message(source);
        }
    }

    if session.last_activity == DateTime::<Utc>::MIN_UTC {
        session.last_activity = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
    }

    session
}

fn apply_record(session: &mut SessionInfo, record: &StoredMessage) {
    session.message_count += 1;
    session.total_cost_usd += record.cost_usd;
    if record.kind == "summary" && !record.summary.is_empty() {
        session.title = record.summary.clone();
    }
    if let Some(model) = record.model() {
        session.model = model;
    }
}

/// Derives a short title from a message, dropping the execution preamble
/// and truncating on a word boundary.
fn title_from_message(message: &str) -> String {
    let message = match message.find(USER_REQUEST_MARKER) {
        Some(idx) => message[idx + USER_REQUEST_MARKER.len()..].trim(),
        None => message.trim(),
    };

    if message.chars().count() <= TITLE_MAX_CHARS {
        return message.to_string();
    }

    let truncated: String = message.chars().take(TITLE_MAX_CHARS).collect();
    let cut = match truncated.rfind(' ') {
        Some(space) if space > TITLE_MAX_CHARS / 2 => &truncated[..space],
        _ => truncated.as_str(),
    };
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn project_dir(root: &Path, project: &str) -> PathBuf {
        let dir = root.join(encode_project_path(project));
        std::fs::create_dir_all(&dir).expect("project dir");
        dir
    }

    fn write_log(dir: &Path, session_id: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(format!("{session_id}.jsonl"));
        let mut file = std::fs::File::create(&path).expect("create log");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        path
    }

    fn append_lines(path: &Path, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .expect("reopen log");
        for line in lines {
            writeln!(file, "{line}").expect("append line");
        }
    }

    const USER_LINE: &str = r#"{"type":"user","uuid":"u1","sessionId":"s1","timestamp":"2026-03-01T09:00:00Z","message":{"role":"user","content":"add a login page to the app"}}"#;
    const ASSISTANT_LINE: &str = r#"{"type":"assistant","uuid":"u2","sessionId":"s1","timestamp":"2026-03-01T09:00:05Z","costUSD":0.02,"message":{"role":"assistant","model":"sonnet","content":[{"type":"text","text":"On it."}]}}"#;
    const SUMMARY_LINE: &str = r#"{"type":"summary","summary":"Login page work"}"#;

    fn watcher_with(
        root: &TempDir,
        callbacks: SessionCallbacks,
    ) -> Arc<SessionWatcher> {
        SessionWatcher::with_root(root.path().to_path_buf(), callbacks).expect("watcher")
    }

    #[tokio::test]
    async fn indexes_session_with_summary_title_and_aggregates() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let path = write_log(&dir, "sess-1", &[USER_LINE, ASSISTANT_LINE, SUMMARY_LINE]);

        let watcher = watcher_with(&root, SessionCallbacks::default());
        assert!(watcher.handle_new_file(&path, false));

        let session = watcher.get_session("sess-1").expect("session");
        assert_eq!(session.title, "Login page work");
        assert_eq!(session.model, "sonnet");
        assert_eq!(session.message_count, 3);
        assert!((session.total_cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(session.project_path, "/tmp/demo");
    }

    #[tokio::test]
    async fn title_falls_back_to_first_user_text_with_preamble_stripped() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let preambled = format!(
            r#"{{"type":"user","message":{{"role":"user","content":"CRITICAL SECURITY RULES: stay inside. {} build me a very long dashboard with charts and filters and exports"}}}}"#,
            USER_REQUEST_MARKER
        );
        let path = write_log(&dir, "sess-2", &[&preambled]);

        let watcher = watcher_with(&root, SessionCallbacks::default());
        watcher.handle_new_file(&path, false);

        let session = watcher.get_session("sess-2").expect("session");
        assert!(session.title.starts_with("build me a very long dashboard"));
        assert!(!session.title.contains("SECURITY"));
        assert!(session.title.chars().count() <= TITLE_MAX_CHARS + 3);
        assert!(session.title.ends_with("..."));
    }

    #[tokio::test]
    async fn unapproved_project_is_never_tracked() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/forbidden");
        let path = write_log(&dir, "sess-3", &[USER_LINE]);

        let callbacks = SessionCallbacks {
            should_watch: Arc::new(|project| project != "/tmp/forbidden"),
            ..Default::default()
        };
        let watcher = watcher_with(&root, callbacks);
        assert!(!watcher.handle_new_file(&path, true));
        assert!(watcher.get_session("sess-3").is_none());

        // Growth in an untracked file is also invisible.
        append_lines(&path, &[ASSISTANT_LINE]);
        watcher.handle_file_modified(&path);
        assert!(watcher.get_session("sess-3").is_none());
    }

    #[tokio::test]
    async fn subagent_logs_are_ignored() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let path = write_log(&dir, "agent-xyz", &[USER_LINE]);

        let watcher = watcher_with(&root, SessionCallbacks::default());
        assert!(!watcher.handle_new_file(&path, true));
        assert!(watcher.get_sessions().is_empty());
    }

    #[tokio::test]
    async fn offsets_advance_monotonically_and_skip_partial_lines() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let path = write_log(&dir, "sess-4", &[USER_LINE]);

        let watcher = watcher_with(&root, SessionCallbacks::default());
        watcher.handle_new_file(&path, false);
        let initial = {
            let index = watcher.index.lock().expect("index");
            index.positions[&path]
        };
        assert_eq!(initial, std::fs::metadata(&path).expect("meta").len());

        // A complete line plus a partial one: the offset stops at the
        // newline.
        append_lines(&path, &[ASSISTANT_LINE]);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen");
        write!(file, "{{\"type\":\"assist").expect("partial");
        drop(file);

        watcher.read_new_lines(&path, initial);
        let after = {
            let index = watcher.index.lock().expect("index");
            index.positions[&path]
        };
        assert!(after > initial, "offset must grow");
        let file_len = std::fs::metadata(&path).expect("meta").len();
        assert!(after < file_len, "offset must stop before the partial line");

        let session = watcher.get_session("sess-4").expect("session");
        assert_eq!(session.message_count, 2);
    }

    #[tokio::test]
    async fn burst_of_appends_debounces_to_one_update() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let path = write_log(&dir, "sess-5", &[USER_LINE]);

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let callbacks = SessionCallbacks {
            on_session_updated: Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let watcher = watcher_with(&root, callbacks);
        watcher.handle_new_file(&path, false);

        // Five rapid appends inside one debounce window.
        for _ in 0..5 {
            let position = {
                let index = watcher.index.lock().expect("index");
                index.positions[&path]
            };
            append_lines(&path, &[ASSISTANT_LINE]);
            watcher.read_new_lines(&path, position);
        }

        tokio::time::sleep(UPDATE_DEBOUNCE + Duration::from_millis(250)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        let session = watcher.get_session("sess-5").expect("session");
        assert_eq!(session.message_count, 6);
    }

    #[tokio::test]
    async fn clear_project_drops_tracking_and_fires_session_end() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");
        let path = write_log(&dir, "sess-6", &[USER_LINE]);

        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = ended.clone();
        let callbacks = SessionCallbacks {
            on_session_end: Some(Arc::new(move |id| {
                sink.lock().expect("ended").push(id);
            })),
            ..Default::default()
        };
        let watcher = watcher_with(&root, callbacks);
        watcher.handle_new_file(&path, false);

        assert_eq!(watcher.clear_project("/tmp/demo"), 1);
        assert_eq!(*ended.lock().expect("ended"), vec!["sess-6".to_string()]);
        assert!(watcher.get_session("sess-6").is_none());

        // Appending to the log after removal records nothing.
        append_lines(&path, &[ASSISTANT_LINE]);
        watcher.handle_file_modified(&path);
        assert!(watcher.get_session("sess-6").is_none());
    }

    #[tokio::test]
    async fn scan_project_batch_discovers_untracked_sessions() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/batch");
        write_log(&dir, "sess-a", &[USER_LINE, SUMMARY_LINE]);
        write_log(&dir, "sess-b", &[USER_LINE]);
        write_log(&dir, "agent-sub", &[USER_LINE]);

        let watcher = watcher_with(&root, SessionCallbacks::default());
        let mut discovered = watcher.scan_project("/tmp/batch");
        discovered.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].session_id, "sess-a");
        assert_eq!(discovered[1].session_id, "sess-b");

        // A second scan finds nothing new.
        assert!(watcher.scan_project("/tmp/batch").is_empty());
    }

    #[tokio::test]
    async fn poller_picks_up_files_missed_by_notify() {
        let root = TempDir::new().expect("root");
        let dir = project_dir(root.path(), "/tmp/demo");

        let watcher = watcher_with(&root, SessionCallbacks::default());
        watcher.poll_for_changes();
        assert!(watcher.get_sessions().is_empty());

        write_log(&dir, "sess-7", &[USER_LINE]);
        watcher.poll_for_changes();
        assert!(watcher.get_session("sess-7").is_some());
    }

    #[test]
    fn title_truncates_on_word_boundary() {
        let long = "implement the entire authentication flow including oauth refresh tokens";
        let title = title_from_message(long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 3);
        assert!(!title[..title.len() - 3].ends_with(' '));

        assert_eq!(title_from_message("short title"), "short title");
    }
}
