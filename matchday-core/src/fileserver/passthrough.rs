use chrono::Duration;
use regex::Regex;
use url::Url;
use uuid::Uuid;

use crate::error::ConfigError;

use super::{Credentials, FileServerPlugin, FileServerResult, SessionCookie};

const PASSTHROUGH_ID: Uuid = Uuid::from_u128(0x6d61_7463_6864_6179_0000_0000_0000_0001);

/// Serves hosts whose public links are already direct downloads, such as a
/// local mirror, plus `file://` URLs. The external URL is returned unchanged.
#[derive(Debug)]
pub struct PassthroughPlugin {
    hosts: Vec<Regex>,
    refresh_rate: Duration,
}

impl PassthroughPlugin {
    pub fn new(patterns: &[String], refresh_rate: Duration) -> Result<Self, ConfigError> {
        let hosts = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| ConfigError::Invalid {
                    field: "fileservers.passthrough_hosts",
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            hosts,
            refresh_rate,
        })
    }
}

#[async_trait::async_trait]
impl FileServerPlugin for PassthroughPlugin {
    fn id(&self) -> Uuid {
        PASSTHROUGH_ID
    }

    fn title(&self) -> &str {
        "Direct link"
    }

    async fn login(&self, _credentials: &Credentials) -> FileServerResult<Vec<SessionCookie>> {
        Ok(Vec::new())
    }

    async fn logout(&self) {}

    fn is_logged_in(&self) -> bool {
        true
    }

    fn accepts_url(&self, url: &Url) -> bool {
        if url.scheme() == "file" {
            return true;
        }
        url.host_str()
            .map(|host| self.hosts.iter().any(|pattern| pattern.is_match(host)))
            .unwrap_or(false)
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }

    async fn download_url(
        &self,
        external_url: &Url,
        _cookies: &[SessionCookie],
    ) -> FileServerResult<Url> {
        Ok(external_url.clone())
    }

    fn requires_login(&self) -> bool {
        false
    }
}
