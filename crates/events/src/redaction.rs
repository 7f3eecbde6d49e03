//! Secret redaction for cache diagnostics.
//!
//! Remote cache credentials (bearer tokens, signature keys) are registered here
//! when a remote store is built. Warnings that may echo request details pass
//! through [`redact`] before they are logged.

use std::collections::BTreeSet;
use std::sync::{LazyLock, RwLock};

/// Values shorter than this are never registered; they would mask ordinary text.
pub const MIN_SECRET_LENGTH: usize = 6;

/// Replacement text for a redacted value.
pub const REDACTED_PLACEHOLDER: &str = "[redacted]";

static SECRETS: LazyLock<RwLock<BTreeSet<String>>> = LazyLock::new(|| RwLock::new(BTreeSet::new()));

/// Register a credential so it is masked in every later [`redact`] call.
///
/// # Example
///
/// ```rust
/// use cachet_events::redaction::{redact, register_secret};
///
/// register_secret("remote-cache-token-12345");
/// assert!(!redact("token=remote-cache-token-12345").contains("12345"));
/// ```
pub fn register_secret(secret: impl Into<String>) {
    let secret = secret.into();
    if secret.len() < MIN_SECRET_LENGTH {
        return;
    }
    if let Ok(mut secrets) = SECRETS.write() {
        secrets.insert(secret);
    }
}

/// Mask every registered credential in `input`.
///
/// Longer secrets are replaced first so that a secret containing another one
/// is masked as a whole.
#[must_use]
pub fn redact(input: &str) -> String {
    let Ok(secrets) = SECRETS.read() else {
        return input.to_string();
    };

    let mut ordered: Vec<&String> = secrets.iter().collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    ordered
        .into_iter()
        .fold(input.to_string(), |text, secret| {
            text.replace(secret.as_str(), REDACTED_PLACEHOLDER)
        })
}

/// Number of registered secrets.
#[must_use]
pub fn secret_count() -> usize {
    SECRETS.read().map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
fn clear_secrets() {
    if let Ok(mut secrets) = SECRETS.write() {
        secrets.clear();
    }
}
