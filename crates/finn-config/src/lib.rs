//! Durable daemon configuration.
//!
//! A single JSON document at `~/.finn/config.json` holds the user/device
//! identity, per-relay auth tokens, the approved-folder list and the
//! execution mode. The relay URL itself is never persisted; it is resolved
//! fresh on every launch from the `--dev` flag and environment. Two legacy
//! layouts are migrated transparently on load: the single `auth_token` field
//! becomes an entry in the `auth_tokens` map, and folder ids that are not
//! UUIDs are rewritten to freshly generated ones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const PRODUCTION_RELAY_URL: &str = "wss://api.tryfinn.ai/ws";
pub const DEV_RELAY_URL: &str = "ws://localhost:8080/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("home directory not resolvable")]
    NoHome,
    #[error("folder limit reached: {current}/{max} folders (tier: {tier})")]
    FolderLimit {
        current: usize,
        max: usize,
        tier: SubscriptionTier,
    },
    #[error("folder with id {0} not found")]
    FolderNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Standard,
    Pro,
    Max,
}

impl SubscriptionTier {
    pub fn max_folders(self) -> usize {
        match self {
            SubscriptionTier::Standard => 5,
            SubscriptionTier::Pro => 10,
            SubscriptionTier::Max => 20,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionTier::Standard => "standard",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Max => "max",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: SubscriptionTier,
    pub max_folders: usize,
    pub active: bool,
}

impl Subscription {
    pub fn new(tier: SubscriptionTier) -> Self {
        Self {
            tier,
            max_folders: tier.max_folders(),
            active: true,
        }
    }

    pub fn can_add_folder(&self, current: usize) -> bool {
        self.active && current < self.max_folders
    }
}

/// How much the user wants to stand between the coder and their tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffApprovalMode {
    #[serde(rename = "show-all")]
    ShowAll,
    #[serde(rename = "show-on-error")]
    ShowOnError,
    #[serde(rename = "auto-approve")]
    AutoApprove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMode {
    #[serde(rename = "interactiveMode")]
    pub interactive_mode: bool,
    #[serde(rename = "diff_approval_mode")]
    pub diff_approval_mode: DiffApprovalMode,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self {
            interactive_mode: true,
            diff_approval_mode: DiffApprovalMode::ShowAll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    /// Legacy single-token field; drained into `auth_tokens` on load.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auth_tokens: HashMap<String, String>,
    /// Resolved at launch, never persisted.
    #[serde(skip)]
    pub relay_url: String,
    #[serde(default)]
    pub approved_folders: Vec<Folder>,
    #[serde(default)]
    pub selected_folder_id: String,
    #[serde(default = "default_subscription")]
    pub subscription: Subscription,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(skip)]
    config_path: PathBuf,
}

fn default_subscription() -> Subscription {
    Subscription::new(SubscriptionTier::Standard)
}

impl Config {
    /// Loads the config, creating a default one on first launch. `dev`
    /// selects the local relay regardless of environment.
    pub fn load(dev: bool) -> Result<Self, ConfigError> {
        let path = default_config_path()?;
        Self::load_from(&path, dev)
    }

    pub fn load_from(path: &Path, dev: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            let mut cfg = Self::default_at(path.to_path_buf());
            cfg.relay_url = resolve_relay_url(dev);
            cfg.save()?;
            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_json::from_str(&data)?;
        cfg.config_path = path.to_path_buf();

        // Tier limits may have changed between releases; recompute.
        cfg.subscription.max_folders = cfg.subscription.tier.max_folders();

        let migrated = cfg.migrate_folder_ids() | cfg.migrate_auth_token();
        if migrated {
            if let Err(err) = cfg.save() {
                warn!("failed to persist migrated config: {err}");
            }
        }

        cfg.relay_url = resolve_relay_url(dev);
        Ok(cfg)
    }

    fn default_at(config_path: PathBuf) -> Self {
        Self {
            user_id: String::new(),
            device_id: default_device_id(),
            auth_token: String::new(),
            auth_tokens: HashMap::new(),
            relay_url: String::new(),
            approved_folders: Vec::new(),
            selected_folder_id: String::new(),
            subscription: default_subscription(),
            execution_mode: ExecutionMode::default(),
            config_path,
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(dir) = self.config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, data)?;
        // Tokens live in this file.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Rewrites non-UUID folder ids, keeping the selected id in step.
    fn migrate_folder_ids(&mut self) -> bool {
        let mut migrated = false;
        for folder in &mut self.approved_folders {
            if Uuid::parse_str(&folder.id).is_err() {
                let new_id = Uuid::new_v4().to_string();
                info!(
                    event = "folder_id_migrated",
                    old = %folder.id,
                    new = %new_id,
                    name = %folder.name
                );
                if self.selected_folder_id == folder.id {
                    self.selected_folder_id = new_id.clone();
                }
                folder.id = new_id;
                migrated = true;
            }
        }
        migrated
    }

    /// Moves the legacy single token under the production relay key.
    fn migrate_auth_token(&mut self) -> bool {
        if !self.auth_tokens.is_empty() || self.auth_token.is_empty() {
            return false;
        }
        let token = std::mem::take(&mut self.auth_token);
        self.auth_tokens
            .insert(PRODUCTION_RELAY_URL.to_string(), token);
        info!(event = "auth_token_migrated", relay = PRODUCTION_RELAY_URL);
        true
    }

    pub fn token(&self, relay_url: &str) -> Option<&str> {
        self.auth_tokens.get(relay_url).map(String::as_str)
    }

    pub fn set_token(&mut self, relay_url: &str, token: &str) {
        self.auth_tokens
            .insert(relay_url.to_string(), token.to_string());
    }

    /// Adds an approved folder, assigning a fresh id. A path that is already
    /// approved is a no-op returning the existing entry.
    pub fn add_folder(&mut self, name: &str, path: &str) -> Result<Folder, ConfigError> {
        if let Some(existing) = self.approved_folders.iter().find(|f| f.path == path) {
            return Ok(existing.clone());
        }

        let current = self.approved_folders.len();
        if !self.subscription.can_add_folder(current) {
            return Err(ConfigError::FolderLimit {
                current,
                max: self.subscription.max_folders,
                tier: self.subscription.tier,
            });
        }

        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            path: path.to_string(),
        };
        self.approved_folders.push(folder.clone());
        Ok(folder)
    }

    /// Removes by id; clears the selection if it pointed at the removed
    /// folder. Returns the removed entry so callers can cascade teardown.
    pub fn remove_folder_by_id(&mut self, id: &str) -> Result<Folder, ConfigError> {
        let index = self
            .approved_folders
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| ConfigError::FolderNotFound(id.to_string()))?;
        let removed = self.approved_folders.remove(index);
        if self.selected_folder_id == removed.id {
            self.selected_folder_id.clear();
        }
        Ok(removed)
    }

    pub fn select_folder(&mut self, id: &str) -> Result<(), ConfigError> {
        if !self.approved_folders.iter().any(|f| f.id == id) {
            return Err(ConfigError::FolderNotFound(id.to_string()));
        }
        self.selected_folder_id = id.to_string();
        Ok(())
    }

    pub fn folder_by_id(&self, id: &str) -> Option<&Folder> {
        self.approved_folders.iter().find(|f| f.id == id)
    }

    pub fn folder_by_path(&self, path: &str) -> Option<&Folder> {
        self.approved_folders.iter().find(|f| f.path == path)
    }

    pub fn is_folder_approved(&self, path: &str) -> bool {
        self.folder_by_path(path).is_some()
    }
}

/// Relay resolution order: `--dev` flag, `FINN_RELAY_URL`, `RELAY_HOST`
/// (host only, ws scheme), production default.
pub fn resolve_relay_url(dev: bool) -> String {
    if dev {
        return DEV_RELAY_URL.to_string();
    }
    if let Ok(url) = std::env::var("FINN_RELAY_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    if let Ok(host) = std::env::var("RELAY_HOST") {
        if !host.trim().is_empty() {
            return format!("ws://{host}/ws");
        }
    }
    PRODUCTION_RELAY_URL.to_string()
}

pub fn home_dir() -> Result<PathBuf, ConfigError> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| ConfigError::NoHome)
}

fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(home_dir()?.join(".finn").join("config.json"))
}

fn default_device_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_default();
    if hostname.is_empty() {
        format!("desktop-{}", std::process::id())
    } else {
        format!("desktop-{hostname}")
    }
}
