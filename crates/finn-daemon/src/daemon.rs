//! Daemon wiring: shared state, the relay connection, and lifecycle.
//!
//! Everything the message handlers touch hangs off one [`Daemon`] value
//! behind an `Arc`; spawned tasks get the `Arc` (or a `Weak` where a cycle
//! would form) and there are no process-level globals. Errors in one
//! conversation, tunnel or watcher callback never cross into another
//! subsystem: each handler catches and reports its own failures.

use crate::router;
use anyhow::Result;
use finn_config::Config;
use finn_core::{msg, Envelope};
use finn_coder::{CoderEvent, EventKind};
use finn_relay::RelayClient;
use finn_tunnel::TunnelClient;
use finn_watcher::SessionWatcher;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// In-memory state for one ongoing conversation. Transient by design: a
/// daemon restart loses the pending set and the next connect finds a dirty
/// working tree the client can still inspect.
pub struct ConversationState {
    pub session: Arc<finn_coder::session::CoderSession>,
    pub folder_id: String,
    pub folder_path: PathBuf,
    /// file path -> approved.
    pub pending_diffs: HashMap<String, bool>,
    pub total_diffs: usize,
    /// Files modified in this conversation, for selective discard.
    pub files: Vec<String>,
    /// True from prompt until the turn's diff/complete arrives; a second
    /// prompt while true is rejected.
    pub turn_active: bool,
}

#[derive(Default)]
pub struct Presence {
    pub mobile: bool,
    pub web: bool,
}

impl Presence {
    pub fn any_online(&self) -> bool {
        self.mobile || self.web
    }
}

pub struct Daemon {
    pub cfg: Mutex<Config>,
    pub relay: RelayClient,
    pub user_id: String,
    pub device_id: String,
    pub headless: bool,

    pub conversations: Mutex<HashMap<String, ConversationState>>,
    /// Snapshot of approved folder paths, readable from sync contexts
    /// (the watcher's filter); kept in step with every config mutation.
    pub approved_paths: StdMutex<std::collections::HashSet<String>>,
    pub presence: StdMutex<Presence>,
    pub tunnels: Mutex<HashMap<String, TunnelClient>>,
    pub dev_servers: Arc<finn_devserver::Manager>,
    pub watcher: StdMutex<Option<Arc<SessionWatcher>>>,
    /// folder id -> last observed HEAD, for the commit sync checker.
    pub last_heads: Mutex<HashMap<String, String>>,

    pub shutdown: watch::Sender<bool>,
    pub weak: Weak<Daemon>,
}

impl Daemon {
    pub fn new(mut cfg: Config, headless: bool) -> Result<Arc<Self>> {
        if cfg.device_id.is_empty() {
            cfg.device_id = format!("desktop-{}", std::process::id());
            cfg.save()?;
        }

        let user_id = cfg.user_id.clone();
        let device_id = cfg.device_id.clone();
        let relay_url = cfg.relay_url.clone();
        let token = cfg.token(&relay_url).unwrap_or_default().to_string();
        let approved_paths: std::collections::HashSet<String> = cfg
            .approved_folders
            .iter()
            .map(|f| f.path.clone())
            .collect();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let handler: finn_relay::MessageHandler = Arc::new(move |envelope| {
            let _ = inbound_tx.send(envelope);
        });
        let relay = RelayClient::new(&relay_url, &token, &device_id, handler);

        let (shutdown, _) = watch::channel(false);

        let daemon = Arc::new_cyclic(|weak| Self {
            cfg: Mutex::new(cfg),
            relay,
            user_id,
            device_id,
            headless,
            conversations: Mutex::new(HashMap::new()),
            approved_paths: StdMutex::new(approved_paths),
            presence: StdMutex::new(Presence::default()),
            tunnels: Mutex::new(HashMap::new()),
            dev_servers: finn_devserver::Manager::new(),
            watcher: StdMutex::new(None),
            last_heads: Mutex::new(HashMap::new()),
            shutdown,
            weak: weak.clone(),
        });

        daemon.spawn_router(inbound_rx);
        Ok(daemon)
    }

    fn spawn_router(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        let Some(daemon) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            // One receiver dispatches everything; handlers that need to
            // outlive the dispatch spawn their own tasks.
            while let Some(envelope) = inbound.recv().await {
                router::handle_message(&daemon, envelope).await;
            }
        });
    }

    pub async fn start(&self) -> Result<()> {
        info!(event = "daemon_start", headless = self.headless);

        // Dev-server crashes surface to clients as preview errors. The
        // supervisor holds only a weak handle back to us.
        let weak = self.weak.clone();
        self.dev_servers
            .set_state_callback(Arc::new(move |folder_id, state, error| {
                if state != finn_devserver::ServerState::Failed {
                    return;
                }
                let message = match error {
                    Some(error) => format!("Dev server crashed: {error}"),
                    None => "Dev server crashed".to_string(),
                };
                let folder_id = folder_id.to_string();
                if let Some(daemon) = weak.upgrade() {
                    tokio::spawn(async move {
                        daemon
                            .send_preview_status(&folder_id, "error", Some(&message))
                            .await;
                    });
                }
            }))
            .await;

        // Connect in the background; the folder list goes out once the
        // link settles.
        let Some(daemon) = self.weak.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            daemon.relay.connect_with_retry().await;
            if daemon.relay.is_connected() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                daemon.send_folder_list().await;
            }
        });

        self.spawn_git_sync_checker();
        self.init_session_watcher();

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!(event = "daemon_shutdown");
        let _ = self.shutdown.send(true);

        let sessions: Vec<ConversationState> = {
            let mut conversations = self.conversations.lock().await;
            conversations.drain().map(|(_, state)| state).collect()
        };
        for state in sessions {
            state.session.stop().await;
        }

        self.dev_servers.stop_all().await;

        let tunnels: Vec<TunnelClient> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, client)| client).collect()
        };
        for tunnel in tunnels {
            tunnel.close().await;
        }

        if let Some(watcher) = self.watcher.lock().expect("watcher lock").take() {
            watcher.stop();
        }

        self.relay.close().await;
    }

    /// Sends one desktop-originated frame; while disconnected the frame is
    /// dropped (the transport never buffers).
    pub async fn send(&self, kind: &str, payload: Value) {
        let envelope = Envelope {
            user_id: self.user_id.clone(),
            device_type: finn_core::DEVICE_TYPE_DESKTOP.to_string(),
            kind: kind.to_string(),
            payload,
        };
        if let Err(err) = self.relay.send(&envelope).await {
            warn!("failed to send {kind}: {err}");
        } else {
            debug!("sent {kind}");
        }
    }

    pub async fn send_error(&self, conversation_id: &str, message: &str) {
        self.send(
            msg::ERROR,
            serde_json::json!({
                "conversation_id": conversation_id,
                "message": message,
            }),
        )
        .await;
    }

    pub fn has_active_clients(&self) -> bool {
        self.presence.lock().expect("presence lock").any_online()
    }

    /// Re-derives the sync approved-path snapshot after a config change.
    pub fn refresh_approved_paths(&self, cfg: &Config) {
        let mut paths = self.approved_paths.lock().expect("approved paths lock");
        paths.clear();
        paths.extend(cfg.approved_folders.iter().map(|f| f.path.clone()));
    }

    pub fn is_path_approved(&self, path: &str) -> bool {
        self.approved_paths
            .lock()
            .expect("approved paths lock")
            .contains(path)
    }

    /// Event handler handed to a coder session; forwards events onto the
    /// control channel and keeps the conversation's approval bookkeeping.
    pub fn coder_event_handler(&self, conversation_id: &str) -> finn_coder::EventHandler {
        let weak = self.weak.clone();
        let conversation_id = conversation_id.to_string();
        Arc::new(move |event: CoderEvent| {
            let Some(daemon) = weak.upgrade() else { return };
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move {
                daemon.forward_coder_event(&conversation_id, event).await;
            });
        })
    }

    async fn forward_coder_event(&self, conversation_id: &str, event: CoderEvent) {
        match event.kind {
            EventKind::Diff => {
                crate::execution::track_diff_event(self, conversation_id, &event.content).await;
            }
            EventKind::Error => {
                // A coder failure ends the conversation; other
                // conversations are untouched.
                let removed = {
                    let mut conversations = self.conversations.lock().await;
                    conversations.remove(conversation_id)
                };
                if let Some(state) = removed {
                    state.session.stop().await;
                    info!(event = "conversation_failed", conversation_id = conversation_id);
                }
            }
            EventKind::Complete => {
                let mut conversations = self.conversations.lock().await;
                if let Some(state) = conversations.get_mut(conversation_id) {
                    state.turn_active = false;
                }
            }
            _ => {}
        }

        let kind = match event.kind {
            EventKind::Thinking => msg::THINKING,
            EventKind::ToolUse => msg::TOOL_USE,
            EventKind::Decision => msg::DECISION,
            EventKind::Diff => msg::DIFF,
            EventKind::Usage => msg::USAGE,
            EventKind::Complete => msg::COMPLETE,
            EventKind::Error => msg::ERROR,
        };
        self.send(
            kind,
            serde_json::json!({
                "conversation_id": conversation_id,
                "data": event.content,
            }),
        )
        .await;
    }

    /// Resolves a folder id against the approved set as it exists right
    /// now. A stale id with a matching approved path is rewritten to the
    /// current id; anything else is a refusal.
    pub async fn resolve_folder(
        &self,
        folder_id: &str,
        fallback_path: Option<&str>,
    ) -> Option<finn_config::Folder> {
        let cfg = self.cfg.lock().await;
        if let Some(folder) = cfg.folder_by_id(folder_id) {
            return Some(folder.clone());
        }
        let path = fallback_path?;
        if path.is_empty() {
            return None;
        }
        let folder = cfg.folder_by_path(path)?;
        info!(
            event = "folder_id_rewritten",
            stale = folder_id,
            current = %folder.id
        );
        Some(folder.clone())
    }
}
