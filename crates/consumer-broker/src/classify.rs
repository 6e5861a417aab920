//! Error classification for broker-level failures.
//!
//! Preferred path is matching on `lapin`'s typed AMQP reply codes; the substring
//! matchers are the fallback for errors that only carry a rendered message
//! (e.g. connection resets surfaced by the underlying TCP/TLS stack).

const RECONNECT_SUBSTRINGS: &[&str] = &[
    "channel closed",
    "connection closed",
    "socket closed",
    "econnreset",
    "enotfound",
    "etimedout",
];

const QUEUE_SCOPED_SUBSTRINGS: &[&str] = &[
    "not_found",
    "not found",
    "does not exist",
    "no queue",
];

const DELIVERY_TAG_SUBSTRINGS: &[&str] = &["unknown delivery tag", "precondition_failed"];

/// AMQP reply codes that indicate a transport-level failure warranting reconnection.
const RECONNECT_REPLY_CODES: &[u16] = &[504, 505, 506];

/// AMQP reply codes that are queue-scoped and must never trigger reconnection.
const QUEUE_SCOPED_REPLY_CODES: &[u16] = &[403, 404];

const DELIVERY_TAG_REPLY_CODE: u16 = 406;

pub fn is_reconnect_worthy(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECONNECT_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

pub fn is_queue_scoped(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUEUE_SCOPED_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

pub fn is_unknown_delivery_tag(message: &str) -> bool {
    let lower = message.to_lowercase();
    DELIVERY_TAG_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Classify a `lapin` error. `lapin::Error`'s rendered message already embeds
/// the AMQP reply code and symbolic name (e.g. "NOT_FOUND", "PRECONDITION_FAILED")
/// for protocol-level failures, so reply-code and substring matching share one path
/// here; a reply code appearing in the text is checked first, ahead of the plain
/// substring fallback, per the compatibility-shim design.
pub fn classify_lapin_error(err: &lapin::Error) -> ErrorClass {
    let message = err.to_string();
    classify_message(&message)
}

pub fn classify_message(message: &str) -> ErrorClass {
    if contains_any_code(message, &[DELIVERY_TAG_REPLY_CODE]) || is_unknown_delivery_tag(message) {
        ErrorClass::UnknownDeliveryTag
    } else if contains_any_code(message, QUEUE_SCOPED_REPLY_CODES) || is_queue_scoped(message) {
        ErrorClass::QueueScoped
    } else if contains_any_code(message, RECONNECT_REPLY_CODES) || is_reconnect_worthy(message) {
        ErrorClass::Reconnect
    } else {
        ErrorClass::Other
    }
}

fn contains_any_code(message: &str, codes: &[u16]) -> bool {
    codes.iter().any(|code| message.contains(&code.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Reconnect,
    QueueScoped,
    UnknownDeliveryTag,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_substrings_match() {
        assert!(is_reconnect_worthy("Channel closed by remote"));
        assert!(is_reconnect_worthy("ECONNRESET during write"));
        assert!(!is_reconnect_worthy("404 NOT_FOUND - no queue 'orders'"));
    }

    #[test]
    fn queue_scoped_substrings_match() {
        assert!(is_queue_scoped("NOT_FOUND - no queue 'orders' in vhost '/'"));
        assert!(is_queue_scoped("queue does not exist"));
        assert!(!is_queue_scoped("connection closed abruptly"));
    }

    #[test]
    fn delivery_tag_substrings_match() {
        assert!(is_unknown_delivery_tag("PRECONDITION_FAILED - unknown delivery tag 42"));
        assert!(!is_unknown_delivery_tag("channel closed"));
    }
}
