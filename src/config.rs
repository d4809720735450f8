//! Configuration loading and types for azstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! client: the storage account, credentials, the request pipeline, the
//! transfer engine, recursive ACL changes and logging.
//!
//! Credentials not given in the file are resolved from the environment:
//! `AZURE_STORAGE_KEY`, then `AZURE_STORAGE_CONNECTION_STRING`, then
//! `AZURE_STORAGE_SAS_TOKEN`.  With none of those the client is anonymous.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::acl::AclOptions;
use crate::clients::{ServiceEndpoints, StorageClient};
use crate::credentials::{Credential, StaticTokenProvider};
use crate::errors::{Result, StorageError};
use crate::pipeline::{new_pipeline, PipelineOptions};
use crate::transfer::TransferOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage account and endpoints.
    #[serde(default)]
    pub account: AccountConfig,

    /// Explicit credentials. Environment variables are used when empty.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Request pipeline: retry, telemetry, keep-alive, logging.
    #[serde(default)]
    pub pipeline: PipelineOptions,

    /// Parallel upload and download tuning.
    #[serde(default)]
    pub transfer: TransferOptions,

    /// Defaults for recursive ACL changes.
    #[serde(default)]
    pub acl: AclOptions,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage account settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account name. May come from a connection string instead.
    #[serde(default)]
    pub name: String,

    /// `https` or `http`.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,

    /// Endpoint overrides, e.g. for an emulator.
    #[serde(default)]
    pub blob_endpoint: Option<String>,
    #[serde(default)]
    pub dfs_endpoint: Option<String>,
    #[serde(default)]
    pub queue_endpoint: Option<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: default_protocol(),
            endpoint_suffix: default_endpoint_suffix(),
            blob_endpoint: None,
            dfs_endpoint: None,
            queue_endpoint: None,
        }
    }
}

/// Credential settings. The first one set wins, in field order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    /// Base64 account key for shared-key signing.
    #[serde(default)]
    pub account_key: Option<String>,

    /// SAS token, with or without the leading `?`.
    #[serde(default)]
    pub sas_token: Option<String>,

    /// Full connection string.
    #[serde(default)]
    pub connection_string: Option<String>,

    /// Pre-acquired OAuth bearer token.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Connection strings -------------------------------------------------------

/// Parsed `Key=Value;...` storage connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub sas_token: Option<String>,
    pub protocol: Option<String>,
    pub endpoint_suffix: Option<String>,
    pub blob_endpoint: Option<String>,
    pub dfs_endpoint: Option<String>,
    pub queue_endpoint: Option<String>,
}

impl FromStr for ConnectionString {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = ConnectionString::default();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // values (keys, SAS tokens) may themselves contain '='
            let (key, value) = part.split_once('=').ok_or_else(|| {
                StorageError::invalid_argument(format!(
                    "malformed connection string segment: {}",
                    part.split('=').next().unwrap_or_default()
                ))
            })?;
            let value = Some(value.to_string());
            match key {
                "AccountName" => out.account_name = value,
                "AccountKey" => out.account_key = value,
                "SharedAccessSignature" => out.sas_token = value,
                "DefaultEndpointsProtocol" => out.protocol = value,
                "EndpointSuffix" => out.endpoint_suffix = value,
                "BlobEndpoint" => out.blob_endpoint = value,
                "DfsEndpoint" => out.dfs_endpoint = value,
                "QueueEndpoint" => out.queue_endpoint = value,
                _ => debug!("ignoring connection string key {}", key),
            }
        }
        if out.account_key.is_none() && out.sas_token.is_none() {
            return Err(StorageError::invalid_argument(
                "connection string has neither AccountKey nor SharedAccessSignature",
            ));
        }
        Ok(out)
    }
}

// -- Resolution ---------------------------------------------------------------

/// Credential and endpoints resolved from config plus environment.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub account_name: String,
    pub credential: Credential,
    pub endpoints: ServiceEndpoints,
}

impl Config {
    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<ResolvedAccount> {
        self.resolve_with(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Resolve with `env` standing in for the process environment.
    pub fn resolve_with<F>(&self, env: F) -> Result<ResolvedAccount>
    where
        F: Fn(&str) -> Option<String>,
    {
        let creds = &self.credentials;
        let config_conn = creds
            .connection_string
            .as_deref()
            .map(ConnectionString::from_str)
            .transpose()?;
        let env_conn = env("AZURE_STORAGE_CONNECTION_STRING")
            .map(|s| ConnectionString::from_str(&s))
            .transpose()?;
        let conn = config_conn.as_ref().or(env_conn.as_ref());

        let account_name = if !self.account.name.is_empty() {
            self.account.name.clone()
        } else {
            conn.and_then(|c| c.account_name.clone()).unwrap_or_default()
        };

        let shared_key = |key: &str| {
            if account_name.is_empty() {
                return Err(StorageError::signature_config(
                    "an account name is required for shared key authentication",
                ));
            }
            Credential::shared_key(&account_name, key)
        };

        let credential = if let Some(key) = &creds.account_key {
            shared_key(key.as_str())?
        } else if let Some(sas) = &creds.sas_token {
            Credential::sas(sas)?
        } else if let Some(c) = &config_conn {
            connection_credential(c, &shared_key)?
        } else if let Some(token) = &creds.bearer_token {
            Credential::token(Arc::new(StaticTokenProvider::new(token.clone())))
        } else if let Some(key) = env("AZURE_STORAGE_KEY") {
            shared_key(&key)?
        } else if let Some(c) = &env_conn {
            connection_credential(c, &shared_key)?
        } else if let Some(sas) = env("AZURE_STORAGE_SAS_TOKEN") {
            Credential::sas(&sas)?
        } else {
            Credential::Anonymous
        };

        let endpoints = self.endpoints(&account_name, conn)?;
        Ok(ResolvedAccount {
            account_name,
            credential,
            endpoints,
        })
    }

    fn endpoints(&self, account_name: &str, conn: Option<&ConnectionString>) -> Result<ServiceEndpoints> {
        let protocol = conn
            .and_then(|c| c.protocol.as_deref())
            .unwrap_or(self.account.protocol.as_str());
        let suffix = conn
            .and_then(|c| c.endpoint_suffix.as_deref())
            .unwrap_or(self.account.endpoint_suffix.as_str());
        let pick = |explicit: &Option<String>, from_conn: Option<&String>| {
            explicit.clone().or_else(|| from_conn.cloned())
        };

        let blob = pick(&self.account.blob_endpoint, conn.and_then(|c| c.blob_endpoint.as_ref()));
        let dfs = pick(&self.account.dfs_endpoint, conn.and_then(|c| c.dfs_endpoint.as_ref()));
        let queue = pick(&self.account.queue_endpoint, conn.and_then(|c| c.queue_endpoint.as_ref()));

        if blob.is_none() && dfs.is_none() && queue.is_none() {
            if account_name.is_empty() {
                return Err(StorageError::invalid_argument(
                    "either an account name or explicit endpoints must be configured",
                ));
            }
            return ServiceEndpoints::for_account(account_name, protocol, suffix);
        }

        let derived = if account_name.is_empty() {
            None
        } else {
            Some(ServiceEndpoints::for_account(account_name, protocol, suffix)?)
        };
        let blob = match blob {
            Some(b) => parse_endpoint("blob", &b)?,
            None => match &derived {
                Some(d) => d.blob.clone(),
                None => {
                    return Err(StorageError::invalid_argument(
                        "a blob endpoint is required when no account name is configured",
                    ))
                }
            },
        };
        let sibling = |explicit: Option<String>, service: &str, from_derived: Option<&Url>| {
            match explicit {
                Some(e) => parse_endpoint(service, &e),
                None => match from_derived {
                    Some(u) => Ok(u.clone()),
                    None => sibling_endpoint(&blob, service),
                },
            }
        };
        let dfs = sibling(dfs, "dfs", derived.as_ref().map(|d| &d.dfs))?;
        let queue = sibling(queue, "queue", derived.as_ref().map(|d| &d.queue))?;

        Ok(ServiceEndpoints { blob, dfs, queue })
    }

    /// Build a client over the standard pipeline.
    pub fn build_client(&self) -> Result<StorageClient> {
        let resolved = self.resolve()?;
        debug!(
            "account {:?}, credential {:?}, blob endpoint {}",
            resolved.account_name, resolved.credential, resolved.endpoints.blob
        );
        let pipeline = new_pipeline(resolved.credential, self.pipeline.clone())?;
        Ok(StorageClient::new(Arc::new(pipeline), resolved.endpoints))
    }
}

fn connection_credential<F>(conn: &ConnectionString, shared_key: &F) -> Result<Credential>
where
    F: Fn(&str) -> Result<Credential>,
{
    match (&conn.account_key, &conn.sas_token) {
        (Some(key), _) => shared_key(key),
        (None, Some(sas)) => Credential::sas(sas),
        (None, None) => Err(StorageError::invalid_argument(
            "connection string has neither AccountKey nor SharedAccessSignature",
        )),
    }
}

fn parse_endpoint(service: &str, value: &str) -> Result<Url> {
    Url::parse(value)
        .map_err(|e| StorageError::invalid_argument(format!("invalid {} endpoint {}: {}", service, value, e)))
}

/// `https://acct.blob.core.windows.net` -> `https://acct.dfs.core.windows.net`.
/// Endpoints without a `.blob.` label (emulators, proxies) are reused as-is.
fn sibling_endpoint(blob: &Url, service: &str) -> Result<Url> {
    let Some(host) = blob.host_str() else {
        return Ok(blob.clone());
    };
    if !host.contains(".blob.") {
        return Ok(blob.clone());
    }
    let mut url = blob.clone();
    url.set_host(Some(&host.replacen(".blob.", &format!(".{}.", service), 1)))
        .map_err(|e| StorageError::invalid_argument(format!("invalid {} endpoint: {}", service, e)))?;
    Ok(url)
}

// -- Defaults ----------------------------------------------------------------

fn default_protocol() -> String {
    "https".to_string()
}

fn default_endpoint_suffix() -> String {
    "core.windows.net".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.pipeline.retry.validate()?;
    config.transfer.validate()?;
    config.acl.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "c2VjcmV0LWtleQ==";

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn config(name: &str) -> Config {
        Config {
            account: AccountConfig {
                name: name.to_string(),
                ..AccountConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_load_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azstore.yaml");
        std::fs::write(
            &path,
            r#"
account:
  name: myacct
pipeline:
  retry:
    max_tries: 6
    retry_delay_ms: 500
transfer:
  chunk_size: 8388608
  max_concurrency: 16
acl:
  batch_size: 500
logging:
  format: json
"#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.account.name, "myacct");
        assert_eq!(cfg.account.protocol, "https");
        assert_eq!(cfg.pipeline.retry.max_tries, 6);
        assert_eq!(cfg.pipeline.retry.retry_delay_ms, 500);
        assert_eq!(cfg.pipeline.retry.max_retry_delay_ms, 120_000);
        assert_eq!(cfg.transfer.max_concurrency, 16);
        assert_eq!(cfg.transfer.max_retry_requests_per_chunk, 5);
        assert_eq!(cfg.acl.batch_size, Some(500));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn test_load_config_rejects_invalid_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "acl:\n  batch_size: 5000\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_parse_connection_string() {
        let conn: ConnectionString = format!(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey={};EndpointSuffix=core.chinacloudapi.cn",
            KEY
        )
        .parse()
        .unwrap();
        assert_eq!(conn.account_name.as_deref(), Some("acct"));
        assert_eq!(conn.account_key.as_deref(), Some(KEY));
        assert_eq!(conn.endpoint_suffix.as_deref(), Some("core.chinacloudapi.cn"));

        let sas: ConnectionString =
            "BlobEndpoint=https://acct.blob.core.windows.net/;SharedAccessSignature=sv=2020-02-10&sig=abc%3D"
                .parse()
                .unwrap();
        assert_eq!(sas.sas_token.as_deref(), Some("sv=2020-02-10&sig=abc%3D"));
        assert!("AccountName=acct".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_env_precedence() {
        let both = env(&[
            ("AZURE_STORAGE_KEY", KEY),
            ("AZURE_STORAGE_SAS_TOKEN", "?sv=1&sig=x"),
        ]);
        let resolved = config("acct").resolve_with(both).unwrap();
        assert!(matches!(resolved.credential, Credential::SharedKey(_)));

        let sas_only = env(&[("AZURE_STORAGE_SAS_TOKEN", "?sv=1&sig=x")]);
        let resolved = config("acct").resolve_with(sas_only).unwrap();
        assert!(matches!(resolved.credential, Credential::Sas(_)));

        let resolved = config("acct").resolve_with(env(&[])).unwrap();
        assert!(matches!(resolved.credential, Credential::Anonymous));
    }

    #[test]
    fn test_config_credentials_win_over_env() {
        let mut cfg = config("acct");
        cfg.credentials.sas_token = Some("sv=1&sig=y".to_string());
        let resolved = cfg
            .resolve_with(env(&[("AZURE_STORAGE_KEY", KEY)]))
            .unwrap();
        assert!(matches!(resolved.credential, Credential::Sas(_)));
    }

    #[test]
    fn test_connection_string_supplies_account_and_endpoints() {
        let conn = format!(
            "DefaultEndpointsProtocol=https;AccountName=fromconn;AccountKey={};EndpointSuffix=core.usgovcloudapi.net",
            KEY
        );
        let resolved = Config::default()
            .resolve_with(env(&[("AZURE_STORAGE_CONNECTION_STRING", conn.as_str())]))
            .unwrap();
        assert_eq!(resolved.account_name, "fromconn");
        assert!(matches!(resolved.credential, Credential::SharedKey(_)));
        assert_eq!(
            resolved.endpoints.dfs.as_str(),
            "https://fromconn.dfs.core.usgovcloudapi.net/"
        );
    }

    #[test]
    fn test_explicit_blob_endpoint_derives_siblings() {
        let mut cfg = Config::default();
        cfg.credentials.connection_string = Some(
            "BlobEndpoint=https://acct.blob.core.windows.net/;SharedAccessSignature=sv=1&sig=z"
                .to_string(),
        );
        let resolved = cfg.resolve_with(env(&[])).unwrap();
        assert!(matches!(resolved.credential, Credential::Sas(_)));
        assert_eq!(resolved.endpoints.dfs.as_str(), "https://acct.dfs.core.windows.net/");
        assert_eq!(resolved.endpoints.queue.as_str(), "https://acct.queue.core.windows.net/");

        let mut emulator = config("devstoreaccount1");
        emulator.account.blob_endpoint = Some("http://127.0.0.1:10000/devstoreaccount1".to_string());
        let resolved = emulator.resolve_with(env(&[])).unwrap();
        assert_eq!(
            resolved.endpoints.blob.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_shared_key_without_account_fails() {
        let err = Config::default()
            .resolve_with(env(&[("AZURE_STORAGE_KEY", KEY)]))
            .unwrap_err();
        assert_eq!(err.code(), "SignatureConfigError");
    }

    #[test]
    fn test_no_account_no_endpoints_fails() {
        let err = Config::default().resolve_with(env(&[])).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }
}
