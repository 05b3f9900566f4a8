use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use thiserror::Error;

use crate::{
    dedup::DEFAULT_RECENT_WINDOW,
    model::{DEFAULT_REQUEST_LOG_CAPACITY, OrgCredentials},
};

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RUNNER_URL: &str = "http://127.0.0.1:5005";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--access-token requires --org-url")]
    TokenWithoutOrg,
    #[error("--org-url requires --access-token")]
    OrgWithoutToken,
    #[error("invalid --org-url {0}")]
    InvalidOrgUrl(String),
    #[error("--fetch-catalog requires org credentials")]
    FetchWithoutCredentials,
}

/// Command line and environment configuration of the edge.
#[derive(Clone, Debug, Parser)]
#[command(name = "pt-edge", version, about = "Local plugin step debugging proxy")]
pub struct EdgeConfig {
    /// Address of the intercepting proxy.
    #[arg(long, env = "PT_DATA_ADDR", default_value = "127.0.0.1:8080")]
    pub data_addr: SocketAddr,

    /// Address of the admin endpoint.
    #[arg(long, env = "PT_ADMIN_ADDR", default_value = "127.0.0.1:8081")]
    pub admin_addr: SocketAddr,

    /// Org base url, e.g. https://contoso.crm.dynamics.com
    #[arg(long, env = "PT_ORG_URL")]
    pub org_url: Option<String>,

    #[arg(long, env = "PT_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Base url of the out-of-process plugin runner.
    #[arg(long, env = "PT_RUNNER_URL", default_value = DEFAULT_RUNNER_URL)]
    pub runner_url: String,

    /// Directories searched for locally built plugin assemblies.
    #[arg(
        long = "assembly-dir",
        env = "PT_ASSEMBLY_DIRS",
        value_delimiter = ','
    )]
    pub assembly_dirs: Vec<PathBuf>,

    /// CSDL metadata file used for schema-aware url parsing.
    #[arg(long, env = "PT_SCHEMA_PATH")]
    pub schema_path: Option<PathBuf>,

    /// Catalog snapshot (JSON) installed at startup.
    #[arg(long, env = "PT_CATALOG_FILE")]
    pub catalog_file: Option<PathBuf>,

    /// Fetch the catalog from the org at startup.
    #[arg(long, env = "PT_FETCH_CATALOG")]
    pub fetch_catalog: bool,

    /// Start with auto-debug enabled for every request.
    #[arg(long, env = "PT_AUTO_DEBUG")]
    pub auto_debug: bool,

    #[arg(long, env = "PT_REQUEST_LOG_CAPACITY", default_value_t = DEFAULT_REQUEST_LOG_CAPACITY)]
    pub request_log_capacity: usize,

    /// Window in which a completed upstream response is replayed to identical
    /// requests. 0 disables replay.
    #[arg(long, env = "PT_DEDUP_WINDOW_MS", default_value_t = DEFAULT_RECENT_WINDOW.as_millis() as u64)]
    pub dedup_window_ms: u64,

    #[arg(long, env = "PT_UPSTREAM_TIMEOUT_MS", default_value_t = DEFAULT_UPSTREAM_TIMEOUT_MS)]
    pub upstream_timeout_ms: u64,
}

impl EdgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.org_url, &self.access_token) {
            (None, Some(_)) => return Err(ConfigError::TokenWithoutOrg),
            (Some(_), None) => return Err(ConfigError::OrgWithoutToken),
            (Some(org_url), Some(_)) => {
                url::Url::parse(org_url)
                    .map_err(|_| ConfigError::InvalidOrgUrl(org_url.clone()))?;
            }
            (None, None) if self.fetch_catalog => {
                return Err(ConfigError::FetchWithoutCredentials);
            }
            (None, None) => {}
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<OrgCredentials> {
        match (&self.org_url, &self.access_token) {
            (Some(org_url), Some(token)) => {
                Some(OrgCredentials::new(org_url.as_str(), token.as_str()))
            }
            _ => None,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms.max(1))
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            data_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            org_url: None,
            access_token: None,
            runner_url: DEFAULT_RUNNER_URL.to_string(),
            assembly_dirs: Vec::new(),
            schema_path: None,
            catalog_file: None,
            fetch_catalog: false,
            auto_debug: false,
            request_log_capacity: DEFAULT_REQUEST_LOG_CAPACITY,
            dedup_window_ms: DEFAULT_RECENT_WINDOW.as_millis() as u64,
            upstream_timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_splits_assembly_dirs() {
        let config = EdgeConfig::try_parse_from([
            "pt-edge",
            "--org-url",
            "https://contoso.crm.dynamics.com",
            "--access-token",
            "token",
            "--assembly-dir",
            "bin/Debug,bin/Release",
            "--dedup-window-ms",
            "0",
            "--auto-debug",
        ])
        .expect("flags should parse");

        assert_eq!(config.assembly_dirs.len(), 2);
        assert_eq!(config.dedup_window(), Duration::ZERO);
        assert!(config.auto_debug);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.credentials().map(|credentials| credentials.org_url),
            Some("https://contoso.crm.dynamics.com".to_string())
        );
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let config = EdgeConfig {
            access_token: Some("token".to_string()),
            ..EdgeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TokenWithoutOrg));

        let config = EdgeConfig {
            org_url: Some("not a url".to_string()),
            access_token: Some("token".to_string()),
            ..EdgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOrgUrl(_))));

        let config = EdgeConfig {
            fetch_catalog: true,
            ..EdgeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::FetchWithoutCredentials));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EdgeConfig::default();
        assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
        assert_eq!(config.dedup_window(), Duration::from_secs(2));
        assert!(config.credentials().is_none());
    }
}
