//! Classification tests across the failure taxonomy.

use mail_e2e_exporter::config::ConfigError;
use mail_e2e_exporter::error::{
    EngineError, ReceiveError, SendError, Step, classify, fingerprint,
};

#[test]
fn each_variant_classifies_to_its_step() {
    let send = EngineError::from(SendError::Timeout(60));
    assert_eq!(classify(&send).step, Step::Send);

    let receive = EngineError::from(ReceiveError::Timeout(120));
    assert_eq!(classify(&receive).step, Step::Receive);

    let config = EngineError::from(ConfigError::Validation("bad".into()));
    assert_eq!(classify(&config).step, Step::Config);
}

#[test]
fn classification_fingerprint_matches_message_fingerprint() {
    let error = EngineError::from(ReceiveError::Auth {
        account: "bob".into(),
        message: "LOGIN failed".into(),
    });
    let classified = classify(&error);
    assert_eq!(classified.fingerprint, fingerprint(&error.to_string()));
}

#[test]
fn same_cause_different_account_ports_share_fingerprint() {
    // Digits are collapsed, so per-attempt volatility folds together.
    let a = fingerprint("smtp transport error: connect to host:587 failed after 3 tries");
    let b = fingerprint("smtp transport error: connect to host:2587 failed after 14 tries");
    assert_eq!(a, b);
}

#[test]
fn case_differences_share_fingerprint() {
    assert_eq!(
        fingerprint("Connection Refused"),
        fingerprint("connection refused")
    );
}

#[test]
fn fingerprints_stay_in_gauge_safe_range() {
    for message in [
        "",
        "a",
        "imap authentication failed",
        "no message matching token within 120s",
        "configuration build error: invalid type",
    ] {
        let value = fingerprint(message);
        assert!((1..=999_999).contains(&value), "out of range for {message:?}");
    }
}

#[test]
fn timeout_and_exhaustion_are_distinct_causes() {
    let timeout = EngineError::from(ReceiveError::Timeout(120));
    let exhausted = EngineError::from(ReceiveError::SearchExhausted(
        "select INBOX: no such mailbox".into(),
    ));
    assert_ne!(
        classify(&timeout).fingerprint,
        classify(&exhausted).fingerprint
    );
}

#[test]
fn permanence_distinguishes_config_from_transient_failures() {
    assert!(SendError::NoSmtpConfig("alice".into()).is_permanent());
    assert!(SendError::NoDestinationAddress("bob".into()).is_permanent());
    assert!(!SendError::Timeout(60).is_permanent());
}
