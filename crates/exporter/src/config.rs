//! Configuration model: exporter settings, mail accounts, routes, and the
//! immutable [`ConfigSnapshot`] the engine runs against.
//!
//! Every setting has an explicit default baked into the type; a config file
//! overrides field by field. Secret values may reference environment
//! variables as `${VAR}`; an unresolved reference is a configuration error,
//! never a panic.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Opaque revision marker of a configuration source, compared for staleness
/// detection only. For files this is the mtime in nanoseconds.
pub type RevisionMarker = u128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("configuration source unavailable: {0}")]
    Source(String),
    #[error("unresolved secret reference `{reference}` in account `{account}`")]
    UnresolvedSecret { account: String, reference: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_subject_prefix() -> String {
    "[MAIL-E2E]".to_string()
}

fn default_metrics_prefix() -> String {
    "mail_".to_string()
}

/// Engine tuning parameters. All fields have defaults; any subset may be
/// overridden from the `exporter:` section of the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExporterSettings {
    pub listen_addr: String,
    pub listen_port: u16,
    pub check_interval_seconds: u64,
    pub receive_timeout_seconds: u64,
    pub receive_poll_seconds: u64,
    pub smtp_timeout_seconds: u64,
    pub delete_testmail_after_verify: bool,
    pub subject_prefix: String,
    pub metrics_prefix: String,
    pub max_concurrent_routes: usize,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: 9782,
            check_interval_seconds: 300,
            receive_timeout_seconds: 120,
            receive_poll_seconds: 5,
            smtp_timeout_seconds: 60,
            delete_testmail_after_verify: true,
            subject_prefix: default_subject_prefix(),
            metrics_prefix: default_metrics_prefix(),
            max_concurrent_routes: 4,
        }
    }
}

/// Outbound transport security. Selected by configuration, never
/// auto-negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plaintext connect, upgrade via STARTTLS (required).
    #[default]
    Starttls,
    /// Implicitly encrypted connection (SMTPS, usually port 465).
    Implicit,
    /// No transport security. Test rigs only.
    None,
}

/// Inbound transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapSecurity {
    /// Implicitly encrypted connection (usually port 993).
    #[default]
    Tls,
    /// No transport security. Test rigs only.
    None,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpAccount {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SmtpSecurity,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapAccount {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub security: ImapSecurity,
    pub username: String,
    pub password: String,
    /// Primary folder searched first.
    #[serde(default = "default_imap_folder")]
    pub folder: String,
    /// Additional folders searched after the primary one.
    #[serde(default)]
    pub extra_folders: Vec<String>,
}

/// One mailbox identity. Either side may be absent: a send-only account has
/// no `imap` section, a receive-only account no `smtp` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub smtp: Option<SmtpAccount>,
    #[serde(default)]
    pub imap: Option<ImapAccount>,
}

/// A sender-account → receiver-account pairing under test.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub from: String,
    pub to: String,
}

impl RouteConfig {
    /// Configured name, or a deterministic one derived from the pairing.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}->{}", self.from, self.to),
        }
    }
}

/// A route that failed validation and is excluded from cycling.
#[derive(Debug, Clone)]
pub struct InvalidRoute {
    pub name: String,
    pub reason: String,
}

/// Raw file shape before secret resolution and route validation.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    exporter: ExporterSettings,
    #[serde(default)]
    accounts: BTreeMap<String, AccountConfig>,
    #[serde(default)]
    routes: Vec<RouteConfig>,
}

/// Immutable, validated view of the configuration at one revision. A reload
/// produces a new snapshot; an installed snapshot is never mutated.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub settings: ExporterSettings,
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Routes whose account keys resolved within this snapshot.
    pub routes: Vec<RouteConfig>,
    pub invalid_routes: Vec<InvalidRoute>,
    pub revision: RevisionMarker,
}

impl ConfigSnapshot {
    /// Parse, resolve secrets and validate routes. Invalid routes are
    /// excluded and flagged; an unresolved secret rejects the snapshot.
    pub fn from_yaml(content: &str, revision: RevisionMarker) -> Result<Self, ConfigError> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        let mut accounts = BTreeMap::new();
        for (key, account) in raw.accounts {
            let resolved = resolve_account(&key, account)?;
            accounts.insert(key, resolved);
        }

        let mut routes = Vec::new();
        let mut invalid_routes = Vec::new();
        for route in raw.routes {
            match validate_route(&route, &accounts) {
                Ok(()) => routes.push(route),
                Err(reason) => {
                    tracing::warn!(
                        route = %route.effective_name(),
                        reason = %reason,
                        "route excluded from cycling"
                    );
                    invalid_routes.push(InvalidRoute {
                        name: route.effective_name(),
                        reason,
                    });
                }
            }
        }

        Ok(Self {
            settings: raw.exporter,
            accounts,
            routes,
            invalid_routes,
            revision,
        })
    }
}

fn validate_route(
    route: &RouteConfig,
    accounts: &BTreeMap<String, AccountConfig>,
) -> Result<(), String> {
    let sender = accounts
        .get(&route.from)
        .ok_or_else(|| format!("unknown sender account `{}`", route.from))?;
    if sender.smtp.is_none() {
        return Err(format!("sender account `{}` has no smtp section", route.from));
    }
    let receiver = accounts
        .get(&route.to)
        .ok_or_else(|| format!("unknown receiver account `{}`", route.to))?;
    if receiver.imap.is_none() {
        return Err(format!("receiver account `{}` has no imap section", route.to));
    }
    Ok(())
}

fn resolve_account(key: &str, account: AccountConfig) -> Result<AccountConfig, ConfigError> {
    let smtp = match account.smtp {
        Some(mut smtp) => {
            smtp.host = expand_value(key, &smtp.host)?;
            smtp.username = expand_value(key, &smtp.username)?;
            smtp.password = expand_value(key, &smtp.password)?;
            Some(smtp)
        }
        None => None,
    };
    let imap = match account.imap {
        Some(mut imap) => {
            imap.host = expand_value(key, &imap.host)?;
            imap.username = expand_value(key, &imap.username)?;
            imap.password = expand_value(key, &imap.password)?;
            Some(imap)
        }
        None => None,
    };
    Ok(AccountConfig { smtp, imap })
}

/// Replace every `${VAR}` occurrence with the value of the environment
/// variable `VAR`. A reference to an unset variable is an error tagged with
/// the account key.
fn expand_value(account: &str, value: &str) -> Result<String, ConfigError> {
    if !value.contains("${") {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ConfigError::Validation(format!(
                "unterminated secret reference in account `{account}`"
            )));
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(resolved) => out.push_str(&resolved),
            Err(_) => {
                return Err(ConfigError::UnresolvedSecret {
                    account: account.to_string(),
                    reference: format!("${{{name}}}"),
                });
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Where configuration content comes from. The engine only compares revision
/// markers; how staleness is detected (mtime, watch, push) stays behind this
/// trait.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Current content together with its revision marker.
    fn fetch(&self) -> Result<(String, RevisionMarker), ConfigError>;
    /// Revision marker alone, cheap enough to call every tick.
    fn revision(&self) -> Result<RevisionMarker, ConfigError>;
}

/// File-backed source using mtime nanoseconds as the revision marker.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn fetch(&self) -> Result<(String, RevisionMarker), ConfigError> {
        let revision = self.revision()?;
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::Source(format!("{}: {e}", self.path.display())))?;
        Ok((content, revision))
    }

    fn revision(&self) -> Result<RevisionMarker, ConfigError> {
        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| ConfigError::Source(format!("{}: {e}", self.path.display())))?;
        let modified = metadata
            .modified()
            .map_err(|e| ConfigError::Source(format!("{}: {e}", self.path.display())))?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ConfigError::Source(format!("{}: {e}", self.path.display())))?
            .as_nanos();
        Ok(nanos)
    }
}
