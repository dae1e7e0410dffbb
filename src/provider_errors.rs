//! Provider error classifier (C6): maps a telephony provider's free-text
//! error into a stable taxonomy, redacts anything that looks like a secret,
//! and produces the user-facing Dutch phrase for it.

use crate::events::EventEmitter;

/// Stable error categories (§4.6). Order of the match cascade in
/// [`classify`] matters and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCategory {
    AuthFailed,
    Misconfigured,
    NetworkError,
    Busy,
    NoAnswer,
    Rejected,
    Failed,
    RateLimited,
    CapacityLimited,
    UnknownError,
}

impl ProviderErrorCategory {
    /// The closed dotted taxonomy from §4.6 — this is the literal that ends
    /// up in a `provider.event{category,...}` record and, via `handle`, as a
    /// session `end_reason`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorCategory::AuthFailed => "provider.auth_failed",
            ProviderErrorCategory::Misconfigured => "provider.misconfigured",
            ProviderErrorCategory::NetworkError => "provider.network_error",
            ProviderErrorCategory::Busy => "call.busy",
            ProviderErrorCategory::NoAnswer => "call.no_answer",
            ProviderErrorCategory::Rejected => "call.rejected",
            ProviderErrorCategory::Failed => "call.failed",
            ProviderErrorCategory::RateLimited => "provider.rate_limited",
            ProviderErrorCategory::CapacityLimited => "provider.capacity_limited",
            ProviderErrorCategory::UnknownError => "provider.unknown_error",
        }
    }

    /// Fixed, non-technical Dutch phrase per category (§4.6).
    pub fn user_message(&self) -> &'static str {
        match self {
            ProviderErrorCategory::Busy => {
                "Het nummer is in gesprek. Zullen we later nog eens proberen?"
            }
            ProviderErrorCategory::NoAnswer => {
                "Er wordt niet opgenomen. Wil je het later opnieuw proberen?"
            }
            ProviderErrorCategory::RateLimited | ProviderErrorCategory::CapacityLimited => {
                "Momentje, het is even druk. Probeer het zo nog eens."
            }
            ProviderErrorCategory::AuthFailed | ProviderErrorCategory::Misconfigured => {
                "Sorry, het lukt nu even niet."
            }
            ProviderErrorCategory::NetworkError
            | ProviderErrorCategory::Rejected
            | ProviderErrorCategory::Failed
            | ProviderErrorCategory::UnknownError => "Sorry, het lukt nu even niet.",
        }
    }
}

/// Classify a provider error message into a stable category.
///
/// Matching is case-insensitive substring cascade, checked in the exact
/// order below; the first match wins.
pub fn classify(message: &str) -> ProviderErrorCategory {
    let lower = message.to_lowercase();

    if lower.contains("auth") || lower.contains("unauthorized") || lower.contains("401") {
        return ProviderErrorCategory::AuthFailed;
    }
    if lower.contains("timeout") || lower.contains("network") || lower.contains("connection") {
        return ProviderErrorCategory::NetworkError;
    }
    if lower.contains("486") || lower.contains("busy") {
        return ProviderErrorCategory::Busy;
    }
    if lower.contains("480") || lower.contains("no answer") || lower.contains("noanswer") {
        return ProviderErrorCategory::NoAnswer;
    }
    if lower.contains("603") || lower.contains("reject") {
        return ProviderErrorCategory::Rejected;
    }
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("throttle") {
        return ProviderErrorCategory::RateLimited;
    }
    if lower.contains("503") || lower.contains("capacity") {
        return ProviderErrorCategory::CapacityLimited;
    }
    if lower.contains("config") || lower.contains("misconfigured") {
        return ProviderErrorCategory::Misconfigured;
    }
    ProviderErrorCategory::UnknownError
}

/// Redact anything that looks like a secret before it ever reaches a log
/// line or a stored event (§4.6).
pub fn redact(detail: &str) -> String {
    let lower = detail.to_lowercase();
    if lower.contains("secret") || lower.contains("password") || lower.contains("key") {
        "[redacted: potential secret]".to_string()
    } else {
        detail.to_string()
    }
}

/// Classify, redact, and emit a `provider.event` for a raw provider error
/// (§4.6). Returns the category so callers can branch on it (e.g. to decide
/// whether to retry).
pub fn handle_error(
    emitter: &EventEmitter,
    session_id: &str,
    raw_message: &str,
    direction: Option<&str>,
    provider: Option<&str>,
) -> ProviderErrorCategory {
    let category = classify(raw_message);
    let detail = redact(raw_message);
    emitter.provider_event(
        session_id,
        category.as_str(),
        direction,
        provider,
        Some(&detail),
    );
    category
}
