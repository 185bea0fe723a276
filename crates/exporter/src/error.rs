//! Failure taxonomy and the classifier that turns any engine failure into a
//! `(step, fingerprint)` pair publishable as metric values.

use crate::config::ConfigError;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Failures while submitting the test message.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("account `{0}` has no smtp section")]
    NoSmtpConfig(String),
    #[error("destination account `{0}` has no usable address")]
    NoDestinationAddress(String),
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("message build failed: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("smtp send timed out after {0}s")]
    Timeout(u64),
}

impl SendError {
    /// Whether retrying within the same cycle could not possibly help.
    /// Informational only; the next scheduled cycle is the retry mechanism.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::NoSmtpConfig(_)
            | Self::NoDestinationAddress(_)
            | Self::Address(_)
            | Self::Message(_) => true,
            Self::Transport(e) => e.is_permanent(),
            Self::Timeout(_) => false,
        }
    }
}

/// Failures while waiting for the test message to arrive.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("account `{0}` has no imap section")]
    NoImapConfig(String),
    #[error("imap authentication failed for `{account}`: {message}")]
    Auth { account: String, message: String },
    #[error("imap connection failed: {0}")]
    Connection(String),
    #[error("imap tls setup failed: {0}")]
    Tls(String),
    #[error("no message matching token within {0}s")]
    Timeout(u64),
    #[error("all search strategies exhausted: {0}")]
    SearchExhausted(String),
}

impl From<std::io::Error> for ReceiveError {
    fn from(error: std::io::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

/// Umbrella over everything the cycle runner can observe.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Phase in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Send,
    Receive,
    Config,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::Send => "send",
            Step::Receive => "receive",
            Step::Config => "config",
        };
        f.write_str(label)
    }
}

/// Classified failure: the step it belongs to and a stable fingerprint of
/// its cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub step: Step,
    pub fingerprint: u64,
}

pub fn classify(error: &EngineError) -> Classified {
    let step = match error {
        EngineError::Send(_) => Step::Send,
        EngineError::Receive(_) => Step::Receive,
        EngineError::Config(_) => Step::Config,
    };
    Classified {
        step,
        fingerprint: fingerprint(&error.to_string()),
    }
}

/// Short, stable, deterministic hash of a normalized error message, folded
/// into `1..=999_999` so it is safe to publish as a gauge value. `0` is
/// reserved to mean "no error".
pub fn fingerprint(message: &str) -> u64 {
    let digest = Sha256::digest(normalize(message).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % 999_999 + 1
}

/// Lowercase and collapse digit runs, so the same cause seen against a
/// different port, pid or message id keeps one fingerprint.
fn normalize(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for c in message.to_lowercase().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_nonzero() {
        let a = fingerprint("imap connection failed: connection refused");
        let b = fingerprint("imap connection failed: connection refused");
        assert_eq!(a, b);
        assert!(a >= 1 && a <= 999_999);
    }

    #[test]
    fn fingerprint_distinguishes_causes() {
        let refused = fingerprint("imap connection failed: connection refused");
        let auth = fingerprint("imap authentication failed for `bob`: LOGIN denied");
        assert_ne!(refused, auth);
    }

    #[test]
    fn fingerprint_ignores_volatile_numbers() {
        let a = fingerprint("connect to mail.example.org:993 timed out");
        let b = fingerprint("connect to mail.example.org:1993 timed out");
        assert_eq!(a, b);
    }

    #[test]
    fn steps_display_lowercase() {
        assert_eq!(Step::Send.to_string(), "send");
        assert_eq!(Step::Receive.to_string(), "receive");
        assert_eq!(Step::Config.to_string(), "config");
    }
}
