mod passthrough;
mod registry;

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub use passthrough::PassthroughPlugin;
pub use registry::{FileServerRegistry, FileServerUser, DEFAULT_REFRESH_RATE_MINUTES};

#[derive(Debug, Error)]
pub enum FileServerError {
    #[error("no enabled file server accepts {0}")]
    NoPlugin(Url),
    #[error("file server plugin not found: {0}")]
    UnknownPlugin(Uuid),
    #[error("file not found at {0}")]
    NotFound(Url),
    #[error("authentication required for {0}")]
    AuthRequired(String),
    #[error("login rejected for {username}: {reason}")]
    LoginFailed { username: String, reason: String },
    #[error("transient file server error: {0}")]
    Transient(String),
}

impl FileServerError {
    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FileServerError::Transient(_))
    }
}

pub type FileServerResult<T> = Result<T, FileServerError>;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
        }
    }
}

/// A file host that turns public share links into time-limited download URLs.
#[async_trait::async_trait]
pub trait FileServerPlugin: Send + Sync {
    fn id(&self) -> Uuid;

    fn title(&self) -> &str;

    /// Signs in and returns the session cookies the host issued.
    async fn login(&self, credentials: &Credentials) -> FileServerResult<Vec<SessionCookie>>;

    async fn logout(&self);

    fn is_logged_in(&self) -> bool;

    fn accepts_url(&self, url: &Url) -> bool;

    /// How long a resolved download URL stays valid.
    fn refresh_rate(&self) -> Duration;

    async fn download_url(
        &self,
        external_url: &Url,
        cookies: &[SessionCookie],
    ) -> FileServerResult<Url>;

    /// Whether resolution needs a logged-in user.
    fn requires_login(&self) -> bool {
        true
    }
}
