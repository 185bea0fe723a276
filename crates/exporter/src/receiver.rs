//! IMAP side of a round-trip: poll the receiver account until the tokened
//! test message shows up, then optionally delete it.
//!
//! Search strategy per folder: a provider-native query first when the server
//! advertises one (Gmail's `X-GM-RAW` behind the `X-GM-EXT-1` capability),
//! plain `SUBJECT` search otherwise or when the native query fails. A
//! completed empty search is authoritative for that poll; the fallback only
//! covers queries the server rejected.

use crate::config::{ConfigSnapshot, ImapAccount, ImapSecurity, RouteConfig};
use crate::error::ReceiveError;
use crate::providers::candidate_folders;
use crate::sender::TestMessage;
use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls_pki_types::ServerName;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Proof that the probe arrived, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReceipt {
    pub folder: String,
}

#[async_trait]
pub trait MailReceiver: Send + Sync {
    /// Block until the probe is observed in the route's receiver mailbox or
    /// the receive timeout elapses.
    async fn wait_for(
        &self,
        snapshot: &ConfigSnapshot,
        route: &RouteConfig,
        probe: &TestMessage,
    ) -> Result<ProbeReceipt, ReceiveError>;
}

/// When to stop polling. Elapsed time is measured from the first attempt, so
/// a poll interval at or above the timeout still yields exactly one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    timeout: Duration,
    poll: Duration,
}

impl PollSchedule {
    pub fn new(timeout_seconds: u64, poll_seconds: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_seconds),
            poll: Duration::from_secs(poll_seconds),
        }
    }

    /// Whether another poll still fits before the deadline.
    pub fn has_next(&self, elapsed: Duration) -> bool {
        elapsed + self.poll < self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout.as_secs()
    }
}

/// Production receiver backed by async-imap over rustls. One connection per
/// verification attempt; nothing is cached between cycles.
#[derive(Debug, Default)]
pub struct ImapMailReceiver;

#[async_trait]
impl MailReceiver for ImapMailReceiver {
    async fn wait_for(
        &self,
        snapshot: &ConfigSnapshot,
        route: &RouteConfig,
        probe: &TestMessage,
    ) -> Result<ProbeReceipt, ReceiveError> {
        let imap = snapshot
            .accounts
            .get(&route.to)
            .and_then(|account| account.imap.as_ref())
            .ok_or_else(|| ReceiveError::NoImapConfig(route.to.clone()))?;
        let schedule = PollSchedule::new(
            snapshot.settings.receive_timeout_seconds,
            snapshot.settings.receive_poll_seconds,
        );
        let folders = candidate_folders(&imap.folder, &imap.extra_folders, &imap.host);
        let delete_after = snapshot.settings.delete_testmail_after_verify;

        // The poll loop bounds itself; this bound only covers the connect
        // and login phase, which sits outside the loop.
        let connect_deadline = Duration::from_secs(snapshot.settings.receive_timeout_seconds);
        match imap.security {
            ImapSecurity::Tls => {
                let mut session = tokio::time::timeout(connect_deadline, login_tls(imap))
                    .await
                    .map_err(|_| {
                        ReceiveError::Connection(format!("connect to {} timed out", imap.host))
                    })??;
                let result =
                    poll_until_found(&mut session, &folders, probe, schedule, delete_after).await;
                let _ = session.logout().await;
                result
            }
            ImapSecurity::None => {
                let mut session = tokio::time::timeout(connect_deadline, login_plain(imap))
                    .await
                    .map_err(|_| {
                        ReceiveError::Connection(format!("connect to {} timed out", imap.host))
                    })??;
                let result =
                    poll_until_found(&mut session, &folders, probe, schedule, delete_after).await;
                let _ = session.logout().await;
                result
            }
        }
    }
}

type TlsSession = Session<tokio_util::compat::Compat<tokio_rustls::client::TlsStream<TcpStream>>>;
type PlainSession = Session<tokio_util::compat::Compat<TcpStream>>;

async fn login_tls(imap: &ImapAccount) -> Result<TlsSession, ReceiveError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(imap.host.clone())
        .map_err(|_| ReceiveError::Tls(format!("invalid server name `{}`", imap.host)))?;

    let tcp = TcpStream::connect((imap.host.as_str(), imap.port)).await?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ReceiveError::Tls(e.to_string()))?;
    login(async_imap::Client::new(tls.compat()), imap).await
}

async fn login_plain(imap: &ImapAccount) -> Result<PlainSession, ReceiveError> {
    let tcp = TcpStream::connect((imap.host.as_str(), imap.port)).await?;
    login(async_imap::Client::new(tcp.compat()), imap).await
}

async fn login<S>(client: async_imap::Client<S>, imap: &ImapAccount) -> Result<Session<S>, ReceiveError>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + Debug,
{
    match client.login(&imap.username, &imap.password).await {
        Ok(session) => Ok(session),
        Err((error, _client)) => Err(map_login_error(&imap.username, error)),
    }
}

fn map_login_error(account: &str, error: async_imap::error::Error) -> ReceiveError {
    match error {
        async_imap::error::Error::No(message) | async_imap::error::Error::Bad(message) => {
            ReceiveError::Auth {
                account: account.to_string(),
                message,
            }
        }
        other => ReceiveError::Connection(other.to_string()),
    }
}

async fn poll_until_found<S>(
    session: &mut Session<S>,
    folders: &[String],
    probe: &TestMessage,
    schedule: PollSchedule,
    delete_after: bool,
) -> Result<ProbeReceipt, ReceiveError>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + Debug,
{
    let native_search = supports_native_search(session).await;
    let started = Instant::now();
    let mut any_search_completed = false;
    let mut last_failure = String::new();

    loop {
        for folder in folders {
            if let Err(error) = session.select(folder).await {
                // Fallback folders routinely do not exist on non-matching
                // servers; record and move on.
                last_failure = format!("select {folder}: {error}");
                tracing::debug!(folder = %folder, error = %error, "folder not selectable");
                continue;
            }
            match search_folder(&mut SessionSearch(session), probe, native_search).await {
                Ok(matches) => {
                    any_search_completed = true;
                    if !matches.is_empty() {
                        tracing::debug!(folder = %folder, hits = matches.len(), "probe found");
                        if delete_after {
                            delete_messages(session, &matches, folder).await;
                        }
                        return Ok(ProbeReceipt {
                            folder: folder.clone(),
                        });
                    }
                }
                Err(error) => {
                    last_failure = format!("search {folder}: {error}");
                    tracing::debug!(folder = %folder, error = %error, "search failed");
                }
            }
        }

        if !schedule.has_next(started.elapsed()) {
            return if any_search_completed {
                Err(ReceiveError::Timeout(schedule.timeout_seconds()))
            } else {
                Err(ReceiveError::SearchExhausted(last_failure))
            };
        }
        tokio::time::sleep(schedule.poll_interval()).await;
    }
}

async fn supports_native_search<S>(session: &mut Session<S>) -> bool
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + Debug,
{
    match session.capabilities().await {
        Ok(capabilities) => capabilities.has_str("X-GM-EXT-1"),
        Err(error) => {
            tracing::debug!(error = %error, "capability query failed");
            false
        }
    }
}

/// Search surface of one selected folder, a seam between the strategy
/// choice and the live session.
#[async_trait]
trait FolderSearch: Send {
    async fn search(&mut self, query: &str) -> Result<HashSet<u32>, async_imap::error::Error>;
}

struct SessionSearch<'a, S>(&'a mut Session<S>)
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Debug;

#[async_trait]
impl<'a, S> FolderSearch for SessionSearch<'a, S>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + Debug,
{
    async fn search(&mut self, query: &str) -> Result<HashSet<u32>, async_imap::error::Error> {
        self.0.search(query).await
    }
}

/// Search the selected folder for the probe token. The native Gmail query
/// runs first and also matches messages that skipped the inbox; a completed
/// native search (even an empty one) is authoritative, only an error from
/// it drops to the portable `SUBJECT` search.
async fn search_folder<F>(
    searcher: &mut F,
    probe: &TestMessage,
    native_search: bool,
) -> Result<Vec<u32>, async_imap::error::Error>
where
    F: FolderSearch,
{
    if native_search {
        let query = format!("X-GM-RAW \"subject:\\\"E2E-{}\\\"\"", probe.token);
        match searcher.search(&query).await {
            Ok(matches) => return Ok(matches.into_iter().collect()),
            Err(error) => {
                tracing::debug!(error = %error, "native search rejected, using subject search");
            }
        }
    }
    let matches = searcher
        .search(&format!("SUBJECT \"E2E-{}\"", probe.token))
        .await?;
    Ok(matches.into_iter().collect())
}

/// Best-effort cleanup of verified probes; a failure here never turns a
/// successful round-trip into an error.
async fn delete_messages<S>(session: &mut Session<S>, sequences: &[u32], folder: &str)
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + Debug,
{
    let set = sequences
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let flagged = match session.store(&set, "+FLAGS (\\Deleted)").await {
        Ok(stream) => stream.try_collect::<Vec<_>>().await,
        Err(error) => Err(error),
    };
    if let Err(error) = flagged {
        tracing::warn!(folder = %folder, error = %error, "failed to flag test message deleted");
        return;
    }
    let expunged = match session.expunge().await {
        Ok(stream) => stream.try_collect::<Vec<_>>().await.map(|_| ()),
        Err(error) => Err(error),
    };
    if let Err(error) = expunged {
        tracing::warn!(folder = %folder, error = %error, "failed to expunge test message");
    }
}
