//! Failure signal classification.

use scrapefleet_proto::FailureSignal;
use serde::{Deserialize, Serialize};

/// Classified failure kinds.
///
/// Every raw signal maps to exactly one kind; the retry policy decides
/// what happens next based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The target served a CAPTCHA challenge.
    Captcha,
    /// The egress identity is blocked by the target.
    Blocked,
    /// The target is rate-limiting requests.
    Throttled,
    /// Transient network failure.
    Network,
    /// Page layout did not match the extraction rules.
    ParseError,
    /// The attempt exceeded its deadline.
    Timeout,
}

impl ErrorKind {
    /// Returns a stable lowercase name for logging and API responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Captcha => "captcha",
            Self::Blocked => "blocked",
            Self::Throttled => "throttled",
            Self::Network => "network",
            Self::ParseError => "parse_error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw failure signal to an [`ErrorKind`].
///
/// Pure and total: ambiguous signals default to [`ErrorKind::Network`].
/// HTTP status takes precedence over message heuristics since it is the
/// less ambiguous of the two.
#[must_use]
pub fn classify(signal: &FailureSignal) -> ErrorKind {
    if let Some(status) = signal.http_status {
        match status {
            403 | 407 | 451 => return ErrorKind::Blocked,
            429 => return ErrorKind::Throttled,
            408 | 504 => return ErrorKind::Timeout,
            _ => {}
        }
    }

    let message = signal.message.to_lowercase();

    if contains_any(&message, &["captcha", "challenge", "are you a robot", "recaptcha"]) {
        ErrorKind::Captcha
    } else if contains_any(&message, &["blocked", "forbidden", "access denied", "banned"]) {
        ErrorKind::Blocked
    } else if contains_any(&message, &["throttl", "rate limit", "too many requests", "slow down"]) {
        ErrorKind::Throttled
    } else if contains_any(&message, &["timeout", "timed out", "deadline"]) {
        ErrorKind::Timeout
    } else if contains_any(
        &message,
        &["parse", "selector", "element not found", "extract", "unexpected layout"],
    ) {
        ErrorKind::ParseError
    } else {
        ErrorKind::Network
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
