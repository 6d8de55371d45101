//! HTTP error classification.
//!
//! Maps provider status codes and error bodies onto crate errors. 429 and
//! quota exhaustion become `RateLimited`; 401 and 403 (and Gemini's "API key
//! not valid" 400) become `Configuration`. Nothing here retries: callers
//! surface `RateLimited` with a retry-later message.

use crate::Error;

/// Convert a non-success HTTP response into a crate error.
pub fn error_for_status(service: &str, status: u16, body: &str) -> Error {
    if status == 429 || is_quota_exhausted(body) {
        return Error::RateLimited(format!("{service} HTTP {status}"));
    }
    if status == 401 || status == 403 || is_invalid_key(body) {
        return Error::Configuration(format!("{service} rejected the credentials (HTTP {status})"));
    }
    Error::Api(format!("{service} HTTP {status}: {}", preview(body, 500)))
}

/// Whether an error body reports exhausted quota (Gemini answers some quota
/// failures with a non-429 status).
pub fn is_quota_exhausted(body: &str) -> bool {
    body.contains("RESOURCE_EXHAUSTED") || body.to_lowercase().contains("quota exceeded")
}

fn is_invalid_key(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("api key not valid") || lower.contains("api_key_invalid")
}

/// Whether a transport error is a timeout or connection failure rather than
/// a bad request.
pub fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
