//! Error taxonomy for the fetch pipeline.
//!
//! None of these reach the consumer of an aggregation run: the proxy fetcher
//! converts every `FetchError` into an empty record list plus a failure signal
//! for the source manager. They surface only through the diagnostic paths
//! (`ProxyFetcher::try_fetch`, `ProgressiveAggregator::probe_source_detailed`).

use std::time::Duration;

/// Raised by the feed parser when a payload cannot be read as a feed at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no feed items found")]
    NoItems,

    #[error("malformed feed xml: {0}")]
    Malformed(String),
}

/// Everything that can go wrong while pulling one source through the relays.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("relay request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("relay returned HTTP {0}")]
    Status(u16),

    #[error("response is not feed-shaped: {0}")]
    Validation(String),

    #[error("feed parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("all {attempts} relay attempts failed; last error: {last}")]
    AllRelaysFailed { attempts: usize, last: String },

    #[error("no relay endpoints configured")]
    NoRelays,

    #[error("source deadline of {0:?} exceeded")]
    Deadline(Duration),

    #[error("unknown source: {0}")]
    UnknownSource(String),
}

/// Coarse classification used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, refused connections, relay failures.
    Transient,
    /// Payload is not a feed or yields nothing usable.
    Validation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Validation(_) | FetchError::Parse(_) => ErrorKind::Validation,
            FetchError::Timeout(_)
            | FetchError::Network(_)
            | FetchError::Status(_)
            | FetchError::AllRelaysFailed { .. }
            | FetchError::NoRelays
            | FetchError::Deadline(_)
            | FetchError::UnknownSource(_) => ErrorKind::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_classify_as_validation() {
        let e: FetchError = ParseError::NoItems.into();
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert_eq!(
            FetchError::Validation("html page".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn network_side_errors_are_transient() {
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(3)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(FetchError::Status(502).kind(), ErrorKind::Transient);
        let all = FetchError::AllRelaysFailed {
            attempts: 3,
            last: "HTTP 403".into(),
        };
        assert_eq!(all.kind(), ErrorKind::Transient);
        assert!(all.to_string().contains("3 relay attempts"));
    }
}
