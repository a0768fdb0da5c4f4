use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::config::FileServersSection;
use crate::error::ConfigError;

use super::{
    Credentials, FileServerError, FileServerPlugin, FileServerResult, PassthroughPlugin,
    SessionCookie,
};

pub const DEFAULT_REFRESH_RATE_MINUTES: i64 = 240;

/// A signed-in account on one file server.
#[derive(Debug, Clone, Serialize)]
pub struct FileServerUser {
    pub username: String,
    pub plugin_id: Uuid,
    pub cookies: Vec<SessionCookie>,
    pub logged_in_at: DateTime<Utc>,
}

pub struct FileServerRegistry {
    plugins: Vec<Arc<dyn FileServerPlugin>>,
    disabled: RwLock<HashSet<Uuid>>,
    disabled_names: Vec<String>,
    users: RwLock<HashMap<Uuid, FileServerUser>>,
    default_refresh_rate: Duration,
}

impl fmt::Debug for FileServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let titles: Vec<&str> = self.plugins.iter().map(|p| p.title()).collect();
        f.debug_struct("FileServerRegistry")
            .field("plugins", &titles)
            .field("default_refresh_rate", &self.default_refresh_rate)
            .finish()
    }
}

impl Default for FileServerRegistry {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_REFRESH_RATE_MINUTES))
    }
}

impl FileServerRegistry {
    pub fn new(default_refresh_rate: Duration) -> Self {
        Self {
            plugins: Vec::new(),
            disabled: RwLock::new(HashSet::new()),
            disabled_names: Vec::new(),
            users: RwLock::new(HashMap::new()),
            default_refresh_rate,
        }
    }

    /// Builds a registry holding the passthrough plugin, honouring the
    /// configured list of disabled plugins.
    pub fn from_config(section: &FileServersSection) -> Result<Self, ConfigError> {
        let minutes = i64::try_from(section.default_refresh_minutes).map_err(|_| {
            ConfigError::Invalid {
                field: "fileservers.default_refresh_minutes",
                reason: "value out of range".into(),
            }
        })?;
        let default_rate = Duration::minutes(minutes);
        let mut registry = Self::new(default_rate);
        registry.disabled_names = section
            .disabled_plugins
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        if !section.passthrough_hosts.is_empty() {
            let passthrough = PassthroughPlugin::new(&section.passthrough_hosts, default_rate)?;
            registry.register(Arc::new(passthrough));
        }
        Ok(registry)
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn FileServerPlugin>) -> Self {
        self.register(plugin);
        self
    }

    /// Adds a plugin. Plugins are consulted in registration order.
    pub fn register(&mut self, plugin: Arc<dyn FileServerPlugin>) {
        let id = plugin.id();
        let title = plugin.title().to_ascii_lowercase();
        let disabled_by_config = self
            .disabled_names
            .iter()
            .any(|name| *name == title || *name == id.to_string());
        if disabled_by_config {
            self.disabled
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id);
        }
        debug!(plugin_id = %id, title = plugin.title(), enabled = !disabled_by_config, "registered file server plugin");
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> &[Arc<dyn FileServerPlugin>] {
        &self.plugins
    }

    pub fn plugin(&self, plugin_id: Uuid) -> Option<Arc<dyn FileServerPlugin>> {
        self.plugins.iter().find(|p| p.id() == plugin_id).cloned()
    }

    pub fn default_refresh_rate(&self) -> Duration {
        self.default_refresh_rate
    }

    pub fn is_enabled(&self, plugin_id: Uuid) -> bool {
        !self
            .disabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&plugin_id)
    }

    pub fn enable(&self, plugin_id: Uuid) -> FileServerResult<()> {
        self.require_plugin(plugin_id)?;
        self.disabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&plugin_id);
        info!(plugin_id = %plugin_id, "file server plugin enabled");
        Ok(())
    }

    pub fn disable(&self, plugin_id: Uuid) -> FileServerResult<()> {
        self.require_plugin(plugin_id)?;
        self.disabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id);
        info!(plugin_id = %plugin_id, "file server plugin disabled");
        Ok(())
    }

    /// The first enabled plugin that accepts `url`.
    pub fn plugin_for_url(&self, url: &Url) -> Option<Arc<dyn FileServerPlugin>> {
        self.plugins
            .iter()
            .find(|plugin| self.is_enabled(plugin.id()) && plugin.accepts_url(url))
            .cloned()
    }

    /// Refresh interval for links served from `url`'s host, falling back to
    /// the registry default when no plugin claims it.
    pub fn refresh_rate_for(&self, url: &Url) -> Duration {
        self.plugin_for_url(url)
            .map(|plugin| plugin.refresh_rate())
            .unwrap_or(self.default_refresh_rate)
    }

    pub async fn login(
        &self,
        plugin_id: Uuid,
        credentials: &Credentials,
    ) -> FileServerResult<FileServerUser> {
        let plugin = self.require_plugin(plugin_id)?;
        let cookies = plugin.login(credentials).await?;
        let user = FileServerUser {
            username: credentials.username.clone(),
            plugin_id,
            cookies,
            logged_in_at: Utc::now(),
        };
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id, user.clone());
        info!(plugin_id = %plugin_id, username = %user.username, "logged in to file server");
        Ok(user)
    }

    pub async fn logout(&self, plugin_id: Uuid) -> FileServerResult<()> {
        let plugin = self.require_plugin(plugin_id)?;
        plugin.logout().await;
        let removed = self
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&plugin_id);
        if let Some(user) = removed {
            info!(plugin_id = %plugin_id, username = %user.username, "logged out of file server");
        }
        Ok(())
    }

    pub fn user_for(&self, plugin_id: Uuid) -> Option<FileServerUser> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&plugin_id)
            .cloned()
    }

    /// Resolves a public link into a direct download URL.
    pub async fn download_url(&self, external_url: &Url) -> FileServerResult<Url> {
        let plugin = self
            .plugin_for_url(external_url)
            .ok_or_else(|| FileServerError::NoPlugin(external_url.clone()))?;

        let cookies = if plugin.requires_login() {
            let user = self
                .user_for(plugin.id())
                .ok_or_else(|| FileServerError::AuthRequired(plugin.title().to_string()))?;
            user.cookies
        } else {
            Vec::new()
        };

        let resolved = plugin.download_url(external_url, &cookies).await?;
        debug!(plugin = plugin.title(), url = %external_url, "resolved download url");
        Ok(resolved)
    }

    fn require_plugin(&self, plugin_id: Uuid) -> FileServerResult<Arc<dyn FileServerPlugin>> {
        self.plugin(plugin_id)
            .ok_or(FileServerError::UnknownPlugin(plugin_id))
    }
}
