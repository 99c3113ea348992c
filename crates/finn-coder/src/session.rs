//! The interactive coder session: one child process per conversation.
//!
//! A session spawns the coder with line-delimited JSON stdio, feeds user
//! turns to stdin, interprets the event stream from stdout, and settles the
//! turn when the terminal `result` frame arrives by diffing the working
//! tree against the pre-turn snapshot. Diffs go to the event handler for
//! remote approval; commit or discard happens on the caller's say-so.

use crate::decision::DecisionParser;
use crate::stream::{AskUserQuestionInput, ExitPlanModeInput, StreamMessage};
use crate::{
    encode_project_path, sessions_root, CoderError, CoderEvent, EventHandler, EventKind,
    SessionLinkedHandler, CODER_BIN, USER_REQUEST_MARKER,
};
use finn_git::Repository;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SESSION_DISCOVERY_POLL: Duration = Duration::from_millis(100);
const SESSION_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_LOG_EXT: &str = "jsonl";

/// State reset at the start of every turn.
#[derive(Default)]
struct TurnState {
    parser: DecisionParser,
    files_before: HashSet<String>,
    completed: bool,
}

pub struct CoderSession {
    project_path: PathBuf,
    repo: Repository,
    on_event: EventHandler,
    requires_approval: bool,

    on_session_linked: Mutex<Option<SessionLinkedHandler>>,
    stdin: Mutex<Option<ChildStdin>>,
    running: AtomicBool,
    turn: Mutex<TurnState>,

    /// Log ids present before the spawn; the first id outside this set is
    /// the child's session.
    sessions_before: Mutex<HashSet<String>>,
    session_detected: AtomicBool,

    /// Self-handle for the tasks this session spawns.
    weak: Weak<CoderSession>,
}

impl CoderSession {
    pub fn new(project_path: &Path, requires_approval: bool, on_event: EventHandler) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            project_path: project_path.to_path_buf(),
            repo: Repository::new(project_path),
            on_event,
            requires_approval,
            on_session_linked: Mutex::new(None),
            stdin: Mutex::new(None),
            running: AtomicBool::new(false),
            turn: Mutex::new(TurnState::default()),
            sessions_before: Mutex::new(HashSet::new()),
            session_detected: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub async fn set_session_linked_handler(&self, handler: SessionLinkedHandler) {
        *self.on_session_linked.lock().await = Some(handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn session_log_dir(&self) -> Option<PathBuf> {
        Some(sessions_root()?.join(encode_project_path(&self.project_path.to_string_lossy())))
    }

    /// Starts an interactive conversation with an initial prompt.
    pub async fn execute_task(&self, prompt: &str) -> Result<(), CoderError> {
        self.capture_existing_sessions().await;
        self.start_new_turn().await?;

        let full_prompt = self.with_preamble(prompt);
        let mut command = Command::new(CODER_BIN);
        command.args([
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]);
        self.spawn_child(command, true).await?;

        if let Some(session) = self.weak.upgrade() {
            tokio::spawn(session.detect_new_session());
        }
        self.send_message(&full_prompt).await
    }

    /// Resumes a prior coder session. With a continuation prompt the child
    /// runs one-shot inside the old session; without one it comes up
    /// interactive for a fresh turn.
    pub async fn resume_session(
        &self,
        session_id: &str,
        continuation_prompt: &str,
    ) -> Result<(), CoderError> {
        info!(event = "coder_resume", session_id = session_id);
        self.start_new_turn().await?;

        let mut command = Command::new(CODER_BIN);
        let interactive = continuation_prompt.is_empty();
        if interactive {
            command.args([
                "--resume",
                session_id,
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]);
        } else {
            command.args([
                "-p",
                continuation_prompt,
                "--resume",
                session_id,
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]);
        }
        self.spawn_child(command, interactive).await
    }

    /// Runs a single non-interactive turn; decisions are never awaited and
    /// the prompt travels as an argument instead of stdin.
    pub async fn execute_one_shot(&self, prompt: &str) -> Result<(), CoderError> {
        self.start_new_turn().await?;

        let full_prompt = self.with_preamble(prompt);
        let mut command = Command::new(CODER_BIN);
        command.args([
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
            full_prompt.as_str(),
        ]);
        self.spawn_child(command, false).await
    }

    async fn spawn_child(&self, mut command: Command, keep_stdin: bool) -> Result<(), CoderError> {
        command
            .current_dir(&self.project_path)
            .stdin(if keep_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;

        if keep_stdin {
            *self.stdin.lock().await = child.stdin.take();
        }
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "coder", "stderr: {line}");
            }
        });

        let session = self.weak.upgrade().ok_or(CoderError::NotRunning)?;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: StreamMessage = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("failed to parse coder frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = session.handle_stream_message(msg).await {
                    warn!("coder stream error: {err}");
                    session.emit(CoderEvent::error(err.to_string()));
                }
            }
            let _ = child.wait().await;
            info!(event = "coder_exited");
            session.running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Writes one user turn as a JSON line on the child's stdin.
    pub async fn send_message(&self, message: &str) -> Result<(), CoderError> {
        if !self.is_running() {
            return Err(CoderError::NotRunning);
        }
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(CoderError::NotRunning)?;

        let frame = json!({
            "type": "user",
            "message": { "role": "user", "content": message },
        });
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        debug!("sent user turn to coder");
        Ok(())
    }

    /// Belt-and-braces instruction pinning the child to the approved
    /// folder; real enforcement is the approval gate and the diff review.
    fn with_preamble(&self, prompt: &str) -> String {
        format!(
            "CRITICAL SECURITY RULES:\n\
             1. You are RESTRICTED to working ONLY within the approved project folder: {path}\n\
             2. DO NOT access, read, or modify ANY files outside this directory under any circumstances\n\
             3. If the user requests access to files outside this folder, politely decline and explain the restriction\n\
             4. DO NOT commit any changes to git - just make the file changes and stop\n\
             5. DO NOT use commands like 'cd ..' or absolute paths that go outside the approved folder\n\n\
             {marker} {prompt}",
            path = self.project_path.display(),
            marker = USER_REQUEST_MARKER,
        )
    }

    async fn start_new_turn(&self) -> Result<(), CoderError> {
        let files_before = match self.repo.detect_changed_files().await {
            Ok(files) => files.into_iter().collect(),
            Err(err) => {
                warn!("failed to snapshot pre-turn changes: {err}");
                HashSet::new()
            }
        };
        let mut turn = self.turn.lock().await;
        turn.parser.reset();
        turn.files_before = files_before;
        turn.completed = false;
        Ok(())
    }

    async fn capture_existing_sessions(&self) {
        let mut known = HashSet::new();
        if let Some(dir) = self.session_log_dir() {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if let Some(id) = log_session_id(&entry.path()) {
                        known.insert(id);
                    }
                }
            }
        }
        debug!("captured {} existing session logs", known.len());
        *self.sessions_before.lock().await = known;
    }

    /// Polls the log directory for a file id not in the pre-spawn snapshot;
    /// the first one is this child's session.
    async fn detect_new_session(self: Arc<Self>) {
        let Some(dir) = self.session_log_dir() else { return };
        let deadline = tokio::time::Instant::now() + SESSION_DISCOVERY_TIMEOUT;
        let mut ticker = tokio::time::interval(SESSION_DISCOVERY_POLL);

        loop {
            ticker.tick().await;
            if self.session_detected.load(Ordering::SeqCst) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                warn!("timed out waiting for new session log");
                return;
            }

            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            let known = self.sessions_before.lock().await;
            for entry in entries.flatten() {
                let Some(id) = log_session_id(&entry.path()) else { continue };
                if known.contains(&id) {
                    continue;
                }
                drop(known);
                self.session_detected.store(true, Ordering::SeqCst);
                info!(event = "session_discovered", session_id = %id);
                let handler = self.on_session_linked.lock().await.clone();
                if let Some(handler) = handler {
                    handler(id);
                }
                return;
            }
        }
    }

    async fn handle_stream_message(&self, msg: StreamMessage) -> Result<(), CoderError> {
        match msg.kind.as_str() {
            "user" => {
                // The child reports its own tool results as user frames.
                for block in &msg.message.content {
                    if block.kind == "tool_result" {
                        debug!("tool result: {}", truncate(&block.text, 120));
                    }
                }
            }
            "system" => debug!("coder system frame: {}", msg.subtype),
            "assistant" => self.handle_assistant(&msg).await,
            "result" => {
                if let Some(usage) = msg.usage {
                    self.emit(CoderEvent::new(
                        EventKind::Usage,
                        json!({
                            "input_tokens": usage.input_tokens,
                            "output_tokens": usage.output_tokens,
                            "cache_read_input_tokens": usage.cache_read_input_tokens,
                            "cache_creation_input_tokens": usage.cache_creation_input_tokens,
                            "cost_usd": msg.total_cost_usd,
                            "duration_ms": msg.duration_ms,
                            "is_final": true,
                        }),
                    ));
                }
                self.handle_completion().await?;
            }
            "error" => {
                return Err(CoderError::Reported(msg.result));
            }
            other => debug!("unhandled coder frame type: {other}"),
        }
        Ok(())
    }

    async fn handle_assistant(&self, msg: &StreamMessage) {
        for block in &msg.message.content {
            match block.kind.as_str() {
                "text" => {
                    self.emit(CoderEvent::new(
                        EventKind::Thinking,
                        json!({ "text": block.text }),
                    ));

                    let mut turn = self.turn.lock().await;
                    turn.parser.add_content(&block.text);
                    if let Some(decision) = turn.parser.extract_decision() {
                        turn.parser.reset();
                        drop(turn);
                        info!(
                            event = "decision_detected",
                            options = decision.options.len()
                        );
                        self.emit(CoderEvent::new(
                            EventKind::Decision,
                            serde_json::to_value(&decision).unwrap_or_default(),
                        ));
                    }
                }
                "tool_use" => self.handle_tool_use(block),
                _ => {}
            }
        }

        if msg.message.stop_reason.as_deref() == Some("end_turn") {
            debug!("coder finished turn, awaiting user input");
        }

        if let Some(usage) = msg.message.usage {
            self.emit(CoderEvent::new(
                EventKind::Usage,
                json!({
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                    "cache_read_input_tokens": usage.cache_read_input_tokens,
                    "cache_creation_input_tokens": usage.cache_creation_input_tokens,
                    "model": msg.message.model,
                }),
            ));
        }
    }

    /// Structured decision points never reach the client as raw tool use;
    /// they are re-cast as decision events.
    fn handle_tool_use(&self, block: &crate::stream::ContentBlock) {
        if block.name == "AskUserQuestion" {
            if let Ok(input) = serde_json::from_value::<AskUserQuestionInput>(block.input.clone()) {
                if let Some(question) = input.questions.into_iter().next() {
                    let options: Vec<_> = question
                        .options
                        .iter()
                        .enumerate()
                        .map(|(i, option)| {
                            json!({
                                "id": (i + 1).to_string(),
                                "label": option.label,
                                "description": option.description,
                            })
                        })
                        .collect();
                    self.emit(CoderEvent::new(
                        EventKind::Decision,
                        json!({
                            "question": question.question,
                            "context": question.header,
                            "options": options,
                            "decision_type": "question",
                        }),
                    ));
                    return;
                }
            }
        }

        if block.name == "ExitPlanMode" {
            if let Ok(input) = serde_json::from_value::<ExitPlanModeInput>(block.input.clone()) {
                if !input.plan.is_empty() {
                    self.emit(CoderEvent::new(
                        EventKind::Decision,
                        json!({
                            "question": "Ready to execute this plan?",
                            "context": input.plan,
                            "options": [
                                {"id": "approve", "label": "Approve & Execute",
                                 "description": "Start executing the plan"},
                                {"id": "revise", "label": "Ask for Changes",
                                 "description": "Tell the coder what to change"},
                            ],
                        }),
                    ));
                    return;
                }
            }
        }

        self.emit(CoderEvent::new(
            EventKind::ToolUse,
            json!({ "tool": block.name, "input": block.input }),
        ));
    }

    /// Settles the turn: the diff set is whatever has pending changes now
    /// and did not before the turn started. Per-file diff failures drop
    /// that file, never the turn.
    async fn handle_completion(&self) -> Result<(), CoderError> {
        let files_after = match self.repo.detect_changed_files().await {
            Ok(files) => files,
            Err(err) => {
                self.emit(CoderEvent::error(format!("Failed to detect changes: {err}")));
                return Err(err.into());
            }
        };

        let files_before = {
            let turn = self.turn.lock().await;
            turn.files_before.clone()
        };
        let mut turn_files: Vec<String> = files_after
            .into_iter()
            .filter(|f| !files_before.contains(f))
            .collect();
        turn_files.sort();

        let mut diffs = serde_json::Map::new();
        for file in &turn_files {
            match self.repo.generate_diff(file).await {
                Ok(diff) if diff.is_empty() => {
                    debug!("empty diff for {file}, skipping");
                }
                Ok(diff) => {
                    diffs.insert(file.clone(), json!(diff));
                }
                Err(err) => {
                    warn!("failed to generate diff for {file}: {err}");
                }
            }
        }

        if diffs.is_empty() {
            debug!("no new changes this turn");
            self.send_complete(json!({ "files_changed": 0 })).await;
            return Ok(());
        }

        let files_changed = diffs.len();
        info!(event = "turn_diffs", files = files_changed);
        self.emit(CoderEvent::new(
            EventKind::Diff,
            json!({
                "diffs": serde_json::Value::Object(diffs),
                "files_changed": files_changed,
                "requires_approval": self.requires_approval,
            }),
        ));

        if !self.requires_approval {
            self.send_complete(json!({
                "files_changed": files_changed,
                "auto_approved": true,
            }))
            .await;
        }
        // Otherwise the conversation holds until every file-level approval
        // arrives; complete fires from continue_after_approval.

        Ok(())
    }

    /// Commits the reviewed changes and fires the turn's complete event.
    pub async fn continue_after_approval(&self, commit_message: &str) -> Result<(), CoderError> {
        if let Err(err) = self.repo.commit_and_push(commit_message).await {
            self.emit(CoderEvent::error(format!("Failed to commit: {err}")));
            return Err(err.into());
        }
        self.send_complete(json!({ "committed": true })).await;
        Ok(())
    }

    pub async fn discard_file(&self, file_path: &str) -> Result<(), CoderError> {
        Ok(self.repo.discard_file(file_path).await?)
    }

    /// At most one complete event per turn.
    async fn send_complete(&self, content: serde_json::Value) {
        let mut turn = self.turn.lock().await;
        if turn.completed {
            debug!("complete already sent this turn");
            return;
        }
        turn.completed = true;
        drop(turn);
        self.emit(CoderEvent::new(EventKind::Complete, content));
    }

    /// Closes stdin so the child sees end-of-input and winds down; the
    /// reader task reaps it.
    pub async fn stop(&self) {
        self.stdin.lock().await.take();
        self.running.store(false, Ordering::SeqCst);
        info!(event = "coder_stopped");
    }

    fn emit(&self, event: CoderEvent) {
        (self.on_event)(event);
    }
}

fn log_session_id(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != SESSION_LOG_EXT {
        return None;
    }
    Some(path.file_stem()?.to_string_lossy().to_string())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (EventHandler, Arc<StdMutex<Vec<CoderEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let handler: EventHandler = Arc::new(move |event| {
            sink.lock().expect("events").push(event);
        });
        (handler, events)
    }

    async fn feed_async(session: &Arc<CoderSession>, line: &str) -> Result<(), CoderError> {
        let msg: StreamMessage = serde_json::from_str(line).expect("frame");
        session.handle_stream_message(msg).await
    }

    fn kinds(events: &Arc<StdMutex<Vec<CoderEvent>>>) -> Vec<EventKind> {
        events.lock().expect("events").iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn assistant_text_becomes_thinking_event() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        feed_async(
            &session,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#,
        )
        .await
        .expect("handle");

        let events = events.lock().expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Thinking);
        assert_eq!(events[0].content["text"], "working on it");
    }

    #[tokio::test]
    async fn ask_user_question_is_recast_as_decision_not_tool_use() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        feed_async(
            &session,
            r#"{"type":"assistant","message":{"content":[{
                "type":"tool_use","name":"AskUserQuestion","id":"tu1",
                "input":{"questions":[{"question":"Which db?","header":"Storage",
                    "options":[{"label":"SQLite","description":"file"},
                               {"label":"Postgres","description":"server"}]}]}}]}}"#,
        )
        .await
        .expect("handle");

        assert_eq!(kinds(&events), vec![EventKind::Decision]);
        let content = &events.lock().expect("events")[0].content;
        assert_eq!(content["question"], "Which db?");
        assert_eq!(content["decision_type"], "question");
        assert_eq!(content["options"][0]["id"], "1");
    }

    #[tokio::test]
    async fn exit_plan_mode_becomes_two_option_decision() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        feed_async(
            &session,
            r#"{"type":"assistant","message":{"content":[{
                "type":"tool_use","name":"ExitPlanMode","id":"tu2",
                "input":{"plan":"1. create file\n2. add tests"}}]}}"#,
        )
        .await
        .expect("handle");

        assert_eq!(kinds(&events), vec![EventKind::Decision]);
        let content = &events.lock().expect("events")[0].content;
        assert_eq!(content["question"], "Ready to execute this plan?");
        assert_eq!(content["context"], "1. create file\n2. add tests");
        assert_eq!(content["options"][0]["id"], "approve");
        assert_eq!(content["options"][1]["id"], "revise");
    }

    #[tokio::test]
    async fn ordinary_tool_use_is_forwarded() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        feed_async(
            &session,
            r#"{"type":"assistant","message":{"content":[{
                "type":"tool_use","name":"Write","id":"tu3",
                "input":{"file_path":"a.txt"}}]}}"#,
        )
        .await
        .expect("handle");

        assert_eq!(kinds(&events), vec![EventKind::ToolUse]);
        let content = &events.lock().expect("events")[0].content;
        assert_eq!(content["tool"], "Write");
    }

    #[tokio::test]
    async fn error_frame_surfaces_as_error() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, _events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        let err = feed_async(&session, r#"{"type":"error","result":"model overloaded"}"#)
            .await
            .expect_err("error frame");
        assert!(matches!(err, CoderError::Reported(ref m) if m == "model overloaded"));
    }

    #[tokio::test]
    async fn usage_events_carry_token_counts() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        feed_async(
            &session,
            r#"{"type":"assistant","message":{
                "model":"sonnet",
                "content":[],
                "usage":{"input_tokens":10,"output_tokens":5}}}"#,
        )
        .await
        .expect("handle");

        let events = events.lock().expect("events");
        assert_eq!(events[0].kind, EventKind::Usage);
        assert_eq!(events[0].content["input_tokens"], 10);
        assert_eq!(events[0].content["model"], "sonnet");
    }

    #[tokio::test]
    async fn textual_decision_fallback_fires_once_then_resets() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), true, handler);

        let frame = |text: &str| {
            format!(
                r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":{}}}]}}}}"#,
                serde_json::to_string(text).expect("encode")
            )
        };

        feed_async(&session, &frame("Which approach should I use?")).await.expect("h");
        feed_async(&session, &frame("1. Redux - global store")).await.expect("h");
        feed_async(&session, &frame("2. Context - built in")).await.expect("h");

        let observed = kinds(&events);
        let decisions = observed.iter().filter(|k| **k == EventKind::Decision).count();
        assert_eq!(decisions, 1, "one decision from the accumulated buffer");

        // The buffer was reset; more prose does not re-fire the decision.
        feed_async(&session, &frame("Good, starting now.")).await.expect("h");
        let decisions_after = kinds(&events)
            .iter()
            .filter(|k| **k == EventKind::Decision)
            .count();
        assert_eq!(decisions_after, 1);
    }

    /// Spec scenario: a turn that created files emits one diff event with
    /// per-file diffs, gated on approval, and no premature complete.
    #[tokio::test]
    async fn completion_flow_diffs_only_turn_files_and_gates_complete() {
        let dir = tempfile::TempDir::new().expect("dir");
        let path = dir.path();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(path)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .status()
                .expect("git");
            assert!(status.success());
        };
        git(&["init", "-q"]);
        std::fs::write(path.join("preexisting.txt"), "dirty before turn\n").expect("write");

        let (handler, events) = collector();
        let session = CoderSession::new(path, true, handler);
        // Snapshot with the pre-existing dirty file in place.
        session.start_new_turn().await.expect("turn");

        // The "coder" writes two files during the turn.
        std::fs::write(path.join("a.txt"), "alpha\n").expect("write");
        std::fs::write(path.join("b.txt"), "beta\n").expect("write");

        feed_async(&session, r#"{"type":"result","result":"done"}"#).await.expect("handle");

        let events = events.lock().expect("events");
        let diff_event = events
            .iter()
            .find(|e| e.kind == EventKind::Diff)
            .expect("diff event");
        let diffs = diff_event.content["diffs"].as_object().expect("diff map");
        assert_eq!(diffs.len(), 2);
        assert!(diffs.contains_key("a.txt"));
        assert!(diffs.contains_key("b.txt"));
        assert!(
            !diffs.contains_key("preexisting.txt"),
            "pre-turn dirt is excluded from the diff set"
        );
        assert_eq!(diff_event.content["requires_approval"], true);
        assert!(
            !events.iter().any(|e| e.kind == EventKind::Complete),
            "complete must wait for approvals in manual mode"
        );
    }

    #[tokio::test]
    async fn auto_approve_mode_completes_immediately_after_diff() {
        let dir = tempfile::TempDir::new().expect("dir");
        let path = dir.path();
        let status = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(path)
            .status()
            .expect("git");
        assert!(status.success());

        let (handler, events) = collector();
        let session = CoderSession::new(path, false, handler);
        session.start_new_turn().await.expect("turn");
        std::fs::write(path.join("gen.txt"), "generated\n").expect("write");

        feed_async(&session, r#"{"type":"result","result":"done"}"#).await.expect("handle");

        let observed = kinds(&events);
        assert!(observed.contains(&EventKind::Diff));
        assert!(observed.contains(&EventKind::Complete));
        let events = events.lock().expect("events");
        let complete = events.iter().find(|e| e.kind == EventKind::Complete).expect("complete");
        assert_eq!(complete.content["auto_approved"], true);
    }

    #[tokio::test]
    async fn complete_fires_at_most_once_per_turn() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, events) = collector();
        let session = CoderSession::new(dir.path(), false, handler);

        session.send_complete(json!({"files_changed": 0})).await;
        session.send_complete(json!({"files_changed": 0})).await;

        assert_eq!(kinds(&events).len(), 1);
    }

    #[tokio::test]
    async fn send_message_requires_running_child() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, _) = collector();
        let session = CoderSession::new(dir.path(), true, handler);
        let err = session.send_message("hi").await.expect_err("not running");
        assert!(matches!(err, CoderError::NotRunning));
    }

    #[test]
    fn preamble_names_the_folder_and_carries_the_marker() {
        let dir = tempfile::TempDir::new().expect("dir");
        let (handler, _) = collector();
        let session = CoderSession::new(dir.path(), true, handler);
        let prompt = session.with_preamble("add dark mode");
        assert!(prompt.contains(&dir.path().display().to_string()));
        assert!(prompt.contains("DO NOT commit"));
        assert!(prompt.ends_with(&format!("{USER_REQUEST_MARKER} add dark mode")));
    }
}
