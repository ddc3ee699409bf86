//! Error taxonomy for progressive retrieval.
//!
//! Fetch-layer failures ([`LoadError`]) terminate the delivery stream of the
//! frame they belong to. [`ChannelError::NothingFound`] is a local signal
//! raised by the convenience accessors on
//! [`ProgressiveChannel`](crate::channel::ProgressiveChannel).

use crate::multipart::ParseError;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while fetching and reassembling pixel data
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Network error fetching {uri}: {source}")]
    Network {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} fetching {uri}")]
    HttpStatus { uri: String, status: u16 },

    #[error("invalid response - {0}")]
    Parse(#[from] ParseError),

    #[error("Load cancelled")]
    Cancelled,

    #[error("Partial state purged")]
    Purged,
}

impl LoadError {
    /// Whether the failure came from the transport or the HTTP status.
    pub fn is_network(&self) -> bool {
        matches!(self, LoadError::Network { .. } | LoadError::HttpStatus { .. })
    }

    /// Transient transport failures worth another attempt.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            LoadError::Network { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }
}

/// Errors surfaced while draining a progressive channel
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error(transparent)]
    Failed(Arc<LoadError>),

    #[error("Nothing found")]
    NothingFound,
}

impl ChannelError {
    /// The load error that failed the stream, if any.
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            ChannelError::Failed(e) => Some(e),
            ChannelError::NothingFound => None,
        }
    }
}

impl From<LoadError> for ChannelError {
    fn from(e: LoadError) -> Self {
        ChannelError::Failed(Arc::new(e))
    }
}

/// Errors reported by a decode sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Decode failed for {image_id}: {message}")]
    DecodeFailed { image_id: String, message: String },

    #[error("Sink closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message() {
        let err = LoadError::from(ParseError::NoBoundary);
        assert_eq!(err.to_string(), "invalid response - no boundary marker");
        assert!(!err.is_network());
    }

    #[test]
    fn test_channel_error_exposes_load_error() {
        let err = ChannelError::from(LoadError::HttpStatus {
            uri: "http://pacs/frames/1".to_string(),
            status: 404,
        });
        assert!(err.load_error().map_or(false, LoadError::is_network));
        assert!(ChannelError::NothingFound.load_error().is_none());
    }
}
