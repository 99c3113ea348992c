//! Live preview: one tunnel per folder, with dev-server auto-start.
//!
//! `preview_start` resolves the folder, makes sure something listens on the
//! requested loopback port (spawning the detected dev command when nothing
//! does), then opens the tunnel and reports readiness. Tunnel state changes
//! flow back to clients as preview-status updates.

use crate::daemon::Daemon;
use finn_core::{msg, PreviewStartPayload, PreviewStopPayload};
use finn_devserver::wait_for_port;
use finn_tunnel::{TunnelClient, TunnelState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PORT_READY_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle_preview_start(daemon: &Arc<Daemon>, payload: Value) {
    let payload: PreviewStartPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse preview_start payload: {err}");
            return;
        }
    };
    info!(
        event = "preview_start",
        folder_id = %payload.folder_id,
        port = payload.local_port
    );

    let Some(folder) = daemon.resolve_folder(&payload.folder_id, None).await else {
        daemon
            .send_preview_status(&payload.folder_id, "error", Some("Folder not found"))
            .await;
        return;
    };

    // An already-connected tunnel means a duplicate request; just repeat
    // the ready message.
    {
        let mut tunnels = daemon.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&folder.id) {
            if existing.is_connected() {
                let port = existing.local_port();
                drop(tunnels);
                daemon.send_preview_ready(&folder.id, port).await;
                return;
            }
            if let Some(stale) = tunnels.remove(&folder.id) {
                drop(tunnels);
                stale.close().await;
            }
        }
    }

    let (relay_url, token) = {
        let cfg = daemon.cfg.lock().await;
        let relay_url = cfg.relay_url.clone();
        let token = cfg.token(&relay_url).unwrap_or_default().to_string();
        (relay_url, token)
    };
    if token.is_empty() {
        daemon
            .send_preview_status(&folder.id, "error", Some("Not authenticated"))
            .await;
        return;
    }

    daemon.send_preview_status(&folder.id, "starting", None).await;

    // Best effort: a failure here may just mean the user runs their own
    // server, so the port wait below is the real arbiter.
    if let Err(err) = daemon
        .dev_servers
        .start(&folder.id, std::path::Path::new(&folder.path), payload.local_port)
        .await
    {
        warn!("could not auto-start dev server: {err}");
    }

    let cancel = daemon.shutdown.subscribe();
    if let Err(err) = wait_for_port(payload.local_port, PORT_READY_TIMEOUT, cancel).await {
        warn!("dev server not ready: {err}");
        daemon
            .send_preview_status(
                &folder.id,
                "error",
                Some("Dev server failed to start - check that the project is set up correctly"),
            )
            .await;
        return;
    }
    daemon.dev_servers.mark_running(&folder.id).await;

    let tunnel = TunnelClient::new(
        &relay_url,
        &token,
        &daemon.user_id,
        &daemon.device_id,
        &folder.id,
        payload.local_port,
    );

    // Reconnection progress is user-visible preview state.
    let weak = daemon.weak.clone();
    tunnel
        .set_state_callback(Arc::new(move |folder_id, state, attempt, max_attempts| {
            let Some(daemon) = weak.upgrade() else { return };
            let folder_id = folder_id.to_string();
            let update = match state {
                TunnelState::Reconnecting => Some((
                    "reconnecting".to_string(),
                    Some(format!("Reconnecting... (attempt {attempt}/{max_attempts})")),
                )),
                TunnelState::Connected if attempt > 0 => {
                    Some(("reconnected".to_string(), None))
                }
                TunnelState::Disconnected if attempt > 0 => Some((
                    "disconnected".to_string(),
                    Some("Connection lost - tap to retry".to_string()),
                )),
                _ => None,
            };
            if let Some((status, message)) = update {
                tokio::spawn(async move {
                    daemon
                        .send_preview_status(&folder_id, &status, message.as_deref())
                        .await;
                });
            }
        }))
        .await;

    if let Err(err) = tunnel.connect().await {
        warn!("failed to connect tunnel: {err}");
        daemon
            .send_preview_status(&folder.id, "error", Some(&err.to_string()))
            .await;
        return;
    }

    // Another request may have raced us while connecting; the connected
    // one wins.
    {
        let mut tunnels = daemon.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&folder.id) {
            if existing.is_connected() {
                let port = existing.local_port();
                drop(tunnels);
                tunnel.close().await;
                warn!("duplicate tunnel for folder {}, keeping the first", folder.id);
                daemon.send_preview_ready(&folder.id, port).await;
                return;
            }
        }
        tunnels.insert(folder.id.clone(), tunnel);
    }

    daemon.send_preview_ready(&folder.id, payload.local_port).await;
}

pub async fn handle_preview_stop(daemon: &Arc<Daemon>, payload: Value) {
    let payload: PreviewStopPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse preview_stop payload: {err}");
            return;
        }
    };
    info!(event = "preview_stop", folder_id = %payload.folder_id);

    daemon.dev_servers.stop(&payload.folder_id).await;

    let tunnel = daemon.tunnels.lock().await.remove(&payload.folder_id);
    match tunnel {
        Some(tunnel) => {
            tunnel.close().await;
            daemon
                .send_preview_status(&payload.folder_id, "stopped", None)
                .await;
        }
        None => warn!("no active tunnel for folder {}", payload.folder_id),
    }
}

impl Daemon {
    pub async fn send_preview_ready(&self, folder_id: &str, local_port: u16) {
        // The relay derives the public URL from the token; this is an
        // opaque reference for the client.
        let preview_url = format!("preview://{folder_id}");
        self.send(
            msg::PREVIEW_READY,
            json!({
                "folder_id": folder_id,
                "preview_url": preview_url,
                "local_port": local_port,
            }),
        )
        .await;
    }

    pub async fn send_preview_status(&self, folder_id: &str, status: &str, error: Option<&str>) {
        let mut payload = json!({
            "folder_id": folder_id,
            "status": status,
        });
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.send(msg::PREVIEW_STATUS, payload).await;
    }
}
