//! SMTP side of a round-trip: build a uniquely-tokened test message and
//! submit it through the route's sender account.

use crate::config::{ConfigSnapshot, RouteConfig, SmtpAccount, SmtpSecurity};
use crate::error::SendError;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// One in-flight probe. The token is what ties the sent message to the
/// search on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage {
    pub token: String,
    pub subject: String,
}

impl TestMessage {
    /// Fresh probe with a unique token embedded in the subject line. The
    /// subject is the only part the receiver matches on. Twelve hex chars
    /// keep the subject readable while staying unique across attempts.
    pub fn new(subject_prefix: &str, route_name: &str) -> Self {
        let token = Uuid::new_v4().simple().to_string()[..12].to_string();
        let subject = format!("{subject_prefix} {route_name} E2E-{token}");
        Self { token, subject }
    }
}

#[async_trait]
pub trait MailSender: Send + Sync {
    /// Submit the probe for this route. Each call stands alone; no
    /// connection state is carried between attempts.
    async fn send(
        &self,
        snapshot: &ConfigSnapshot,
        route: &RouteConfig,
        probe: &TestMessage,
    ) -> Result<(), SendError>;
}

/// Production sender backed by lettre. A new transport is built per attempt
/// so a broken connection can never poison later cycles.
#[derive(Debug, Default)]
pub struct SmtpMailSender;

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(
        &self,
        snapshot: &ConfigSnapshot,
        route: &RouteConfig,
        probe: &TestMessage,
    ) -> Result<(), SendError> {
        let smtp = snapshot
            .accounts
            .get(&route.from)
            .and_then(|account| account.smtp.as_ref())
            .ok_or_else(|| SendError::NoSmtpConfig(route.from.clone()))?;
        let to = destination_address(snapshot, &route.to)?;
        let email = build_message(smtp, &to, probe)?;

        let timeout_seconds = snapshot.settings.smtp_timeout_seconds;
        let transport = build_transport(smtp, timeout_seconds)?;
        tracing::debug!(
            route = %route.effective_name(),
            host = %smtp.host,
            port = smtp.port,
            "submitting test message"
        );
        match tokio::time::timeout(Duration::from_secs(timeout_seconds), transport.send(email))
            .await
        {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(SendError::Timeout(timeout_seconds)),
        }
    }
}

/// The address a probe for this route is delivered to: the receiver
/// account's IMAP login if it is a full address, otherwise its SMTP login.
fn destination_address(snapshot: &ConfigSnapshot, account_key: &str) -> Result<Mailbox, SendError> {
    let account = snapshot
        .accounts
        .get(account_key)
        .ok_or_else(|| SendError::NoDestinationAddress(account_key.to_string()))?;
    let candidate = [
        account.imap.as_ref().map(|imap| imap.username.as_str()),
        account.smtp.as_ref().map(|smtp| smtp.username.as_str()),
    ]
    .into_iter()
    .flatten()
    .find(|username| username.contains('@'))
    .ok_or_else(|| SendError::NoDestinationAddress(account_key.to_string()))?;
    Ok(candidate.parse()?)
}

fn build_message(smtp: &SmtpAccount, to: &Mailbox, probe: &TestMessage) -> Result<Message, SendError> {
    let from: Mailbox = smtp.username.parse()?;
    let sent_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let body = format!(
        "Automated end-to-end mail delivery test.\n\
         Token: {}\nSent: {}\n\nThis message is verified and removed automatically.\n",
        probe.token, sent_at
    );
    let email = Message::builder()
        .from(from)
        .to(to.clone())
        .subject(&probe.subject)
        .header(ContentType::TEXT_PLAIN)
        .header(lettre::message::header::MIME_VERSION_1_0)
        .body(body)?;
    Ok(email)
}

fn build_transport(
    smtp: &SmtpAccount,
    timeout_seconds: u64,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
    let mut builder = match smtp.security {
        SmtpSecurity::Starttls => {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
        }
        SmtpSecurity::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)?,
        SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host),
    };
    builder = builder
        .port(smtp.port)
        .timeout(Some(Duration::from_secs(timeout_seconds)));
    if !smtp.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            smtp.username.clone(),
            smtp.password.clone(),
        ));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, ImapAccount, ImapSecurity};
    use std::collections::BTreeMap;

    fn smtp_account(username: &str) -> SmtpAccount {
        SmtpAccount {
            host: "smtp.example.org".into(),
            port: 587,
            security: SmtpSecurity::Starttls,
            username: username.into(),
            password: "pw".into(),
        }
    }

    fn imap_account(username: &str) -> ImapAccount {
        ImapAccount {
            host: "imap.example.org".into(),
            port: 993,
            security: ImapSecurity::Tls,
            username: username.into(),
            password: "pw".into(),
            folder: "INBOX".into(),
            extra_folders: Vec::new(),
        }
    }

    fn snapshot_with(accounts: BTreeMap<String, AccountConfig>) -> ConfigSnapshot {
        ConfigSnapshot {
            settings: Default::default(),
            accounts,
            routes: Vec::new(),
            invalid_routes: Vec::new(),
            revision: 0,
        }
    }

    #[test]
    fn probe_subject_embeds_prefix_route_and_token() {
        let probe = TestMessage::new("[MAIL-E2E]", "alice->bob");
        assert!(probe.subject.starts_with("[MAIL-E2E] alice->bob E2E-"));
        assert!(probe.subject.ends_with(&probe.token));
        assert_eq!(probe.token.len(), 12);
        assert!(probe.token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn probes_are_unique() {
        let a = TestMessage::new("[MAIL-E2E]", "r");
        let b = TestMessage::new("[MAIL-E2E]", "r");
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn destination_prefers_imap_login() {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "bob".to_string(),
            AccountConfig {
                smtp: Some(smtp_account("bob-smtp@example.org")),
                imap: Some(imap_account("bob@example.org")),
            },
        );
        let snapshot = snapshot_with(accounts);
        let mailbox = destination_address(&snapshot, "bob").unwrap();
        assert_eq!(mailbox.email.to_string(), "bob@example.org");
    }

    #[test]
    fn destination_falls_back_to_smtp_login() {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "bob".to_string(),
            AccountConfig {
                smtp: Some(smtp_account("bob@example.org")),
                imap: Some(imap_account("bob")),
            },
        );
        let snapshot = snapshot_with(accounts);
        let mailbox = destination_address(&snapshot, "bob").unwrap();
        assert_eq!(mailbox.email.to_string(), "bob@example.org");
    }

    #[test]
    fn destination_requires_a_full_address() {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "bob".to_string(),
            AccountConfig {
                smtp: Some(smtp_account("bob")),
                imap: Some(imap_account("bob")),
            },
        );
        let snapshot = snapshot_with(accounts);
        let err = destination_address(&snapshot, "bob").unwrap_err();
        assert!(matches!(err, SendError::NoDestinationAddress(_)));
    }

    #[test]
    fn message_builds_with_plain_body() {
        let probe = TestMessage::new("[MAIL-E2E]", "alice->bob");
        let to: Mailbox = "bob@example.org".parse().unwrap();
        let email = build_message(&smtp_account("alice@example.org"), &to, &probe).unwrap();
        let rendered = String::from_utf8(email.formatted()).unwrap();
        assert!(rendered.contains(&probe.token));
    }
}
