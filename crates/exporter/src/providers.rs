//! Provider-aware folder fallbacks for label-style mailboxes.
//!
//! Some providers model mailboxes as labels rather than folders; a delivered
//! message may only be visible under "All Mail", "Spam" or "Important", and
//! the IMAP names for those are localized per account language. The table
//! below is data-driven so new providers or locales are one entry, not a new
//! branch.

/// Folder fallbacks for one label-mailbox provider, matched by mail host.
#[derive(Debug)]
pub struct LabelProvider {
    pub domains: &'static [&'static str],
    /// Label names in priority order, covering English and German variants.
    pub folders: &'static [&'static str],
}

pub const LABEL_PROVIDERS: &[LabelProvider] = &[LabelProvider {
    // The namespace differs by account age and language: older German
    // accounts use "[Google Mail]" instead of "[Gmail]".
    domains: &["gmail.com", "googlemail.com"],
    folders: &[
        "[Gmail]/All Mail",
        "[Gmail]/Spam",
        "[Gmail]/Important",
        "[Gmail]/Alle Nachrichten",
        "[Gmail]/Wichtig",
        "[Google Mail]/All Mail",
        "[Google Mail]/Spam",
        "[Google Mail]/Important",
        "[Google Mail]/Alle Nachrichten",
        "[Google Mail]/Wichtig",
    ],
}];

/// Fallback folders for the given IMAP host, empty for providers with a
/// plain folder model.
pub fn fallback_folders(host: &str) -> &'static [&'static str] {
    let host = host.to_ascii_lowercase();
    for provider in LABEL_PROVIDERS {
        let matched = provider
            .domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
        if matched {
            return provider.folders;
        }
    }
    &[]
}

/// Full candidate folder list in search priority order: the configured
/// primary folder, configured extras, then provider fallbacks, deduplicated.
pub fn candidate_folders(primary: &str, extras: &[String], host: &str) -> Vec<String> {
    let mut folders = vec![primary.to_string()];
    for extra in extras {
        if !folders.contains(extra) {
            folders.push(extra.clone());
        }
    }
    for name in fallback_folders(host) {
        if !folders.iter().any(|f| f == name) {
            folders.push((*name).to_string());
        }
    }
    folders
}
