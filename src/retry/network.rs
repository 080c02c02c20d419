//! Network error classification.
//!
//! Typed inspection comes first: the error and its `source()` chain are
//! searched for [`TransportError`], `std::io::Error`, tokio's `Elapsed`, and
//! `reqwest::Error`. Only when none of those are found does the classifier
//! fall back to matching well-known phrases in the rendered error chain.

use crate::error::TransportError;
use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Coarse category of a failure that happened below HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    DeadlineExceeded,
    Timeout,
    Cancelled,
    Dns,
    Tls,
    ConnectionRefused,
    ConnectionReset,
    BrokenPipe,
    UnexpectedEof,
    Other,
}

impl NetworkErrorKind {
    /// Transient conditions are worth another attempt; configuration
    /// problems (DNS, TLS, refused connections) and cancellation are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            NetworkErrorKind::DeadlineExceeded
                | NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::BrokenPipe
                | NetworkErrorKind::UnexpectedEof
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkErrorKind::DeadlineExceeded => "deadline_exceeded",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Cancelled => "cancelled",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Tls => "tls",
            NetworkErrorKind::ConnectionRefused => "connection_refused",
            NetworkErrorKind::ConnectionReset => "connection_reset",
            NetworkErrorKind::BrokenPipe => "broken_pipe",
            NetworkErrorKind::UnexpectedEof => "unexpected_eof",
            NetworkErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Order matters: the more specific phrase wins.
const PHRASES: &[(&str, NetworkErrorKind)] = &[
    ("deadline exceeded", NetworkErrorKind::DeadlineExceeded),
    ("deadline has elapsed", NetworkErrorKind::DeadlineExceeded),
    ("context canceled", NetworkErrorKind::Cancelled),
    ("operation was canceled", NetworkErrorKind::Cancelled),
    ("cancelled", NetworkErrorKind::Cancelled),
    ("no such host", NetworkErrorKind::Dns),
    ("dns error", NetworkErrorKind::Dns),
    ("failed to lookup address", NetworkErrorKind::Dns),
    ("name or service not known", NetworkErrorKind::Dns),
    ("certificate", NetworkErrorKind::Tls),
    ("x509", NetworkErrorKind::Tls),
    ("tls handshake", NetworkErrorKind::Tls),
    ("connection refused", NetworkErrorKind::ConnectionRefused),
    ("connection reset", NetworkErrorKind::ConnectionReset),
    ("reset by peer", NetworkErrorKind::ConnectionReset),
    ("broken pipe", NetworkErrorKind::BrokenPipe),
    ("unexpected eof", NetworkErrorKind::UnexpectedEof),
    ("unexpected end of file", NetworkErrorKind::UnexpectedEof),
    ("timed out", NetworkErrorKind::Timeout),
    ("timeout", NetworkErrorKind::Timeout),
];

/// Classifies `err` into a [`NetworkErrorKind`], or `None` when it is not a
/// network failure at all.
pub fn classify_network_error(err: &(dyn StdError + 'static)) -> Option<NetworkErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(transport) = e.downcast_ref::<TransportError>() {
            return transport.network_kind();
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(kind) = from_io_kind(io_err.kind()) {
                return Some(kind);
            }
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some(NetworkErrorKind::DeadlineExceeded);
        }
        if let Some(http) = e.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() {
                return Some(NetworkErrorKind::Timeout);
            }
        }
        current = e.source();
    }

    from_message(&render_chain(err))
}

/// True when `err` is a network failure worth retrying.
pub fn is_retryable_network_error(err: &(dyn StdError + 'static)) -> bool {
    classify_network_error(err).is_some_and(NetworkErrorKind::is_retryable)
}

fn from_io_kind(kind: io::ErrorKind) -> Option<NetworkErrorKind> {
    match kind {
        io::ErrorKind::TimedOut => Some(NetworkErrorKind::Timeout),
        io::ErrorKind::ConnectionRefused => Some(NetworkErrorKind::ConnectionRefused),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            Some(NetworkErrorKind::ConnectionReset)
        }
        io::ErrorKind::BrokenPipe => Some(NetworkErrorKind::BrokenPipe),
        io::ErrorKind::UnexpectedEof => Some(NetworkErrorKind::UnexpectedEof),
        _ => None,
    }
}

fn from_message(message: &str) -> Option<NetworkErrorKind> {
    let lowered = message.to_ascii_lowercase();
    PHRASES.iter().find(|(phrase, _)| lowered.contains(phrase)).map(|(_, kind)| *kind)
}

fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        rendered.push_str(": ");
        rendered.push_str(&e.to_string());
        current = e.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "send failed")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct Opaque(&'static str);

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Opaque {}

    #[test]
    fn io_kinds_are_inspected_through_the_source_chain() {
        let err = Wrapped(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"));
        assert_eq!(classify_network_error(&err), Some(NetworkErrorKind::ConnectionReset));
        assert!(is_retryable_network_error(&err));

        let refused = Wrapped(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(classify_network_error(&refused), Some(NetworkErrorKind::ConnectionRefused));
        assert!(!is_retryable_network_error(&refused));
    }

    #[test]
    fn transport_errors_are_classified_by_type_not_text() {
        let timeout = TransportError::Timeout(Duration::from_secs(1));
        assert_eq!(classify_network_error(&timeout), Some(NetworkErrorKind::Timeout));

        // The body mentions a timeout but this is an HTTP-level rejection.
        let client = TransportError::Client { status: 400, body: "timeout field invalid".into() };
        assert_eq!(classify_network_error(&client), None);
    }

    #[tokio::test]
    async fn elapsed_is_a_deadline() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(classify_network_error(&elapsed), Some(NetworkErrorKind::DeadlineExceeded));
        assert!(is_retryable_network_error(&elapsed));
    }

    #[test]
    fn text_fallback_recognizes_common_phrases() {
        let cases = [
            ("dial tcp: lookup api.example.invalid: no such host", Some(NetworkErrorKind::Dns)),
            ("x509: certificate signed by unknown authority", Some(NetworkErrorKind::Tls)),
            ("write: broken pipe", Some(NetworkErrorKind::BrokenPipe)),
            ("read: connection reset by peer", Some(NetworkErrorKind::ConnectionReset)),
            ("context deadline exceeded", Some(NetworkErrorKind::DeadlineExceeded)),
            ("context canceled", Some(NetworkErrorKind::Cancelled)),
            ("unexpected EOF", Some(NetworkErrorKind::UnexpectedEof)),
            ("i/o timeout", Some(NetworkErrorKind::Timeout)),
            ("invalid json payload", None),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_network_error(&Opaque(message)), expected, "{message}");
        }
    }

    #[test]
    fn retryable_kinds() {
        assert!(NetworkErrorKind::DeadlineExceeded.is_retryable());
        assert!(NetworkErrorKind::UnexpectedEof.is_retryable());
        assert!(!NetworkErrorKind::Cancelled.is_retryable());
        assert!(!NetworkErrorKind::Dns.is_retryable());
        assert!(!NetworkErrorKind::Tls.is_retryable());
        assert!(!NetworkErrorKind::Other.is_retryable());
    }
}
