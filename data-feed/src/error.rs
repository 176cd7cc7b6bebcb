use thiserror::Error;

use crate::payload::PayloadError;

/// Failure of a chart fetch, shared verbatim with every waiter on the same request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Superseded by a newer request.
    #[error("request aborted")]
    Aborted,
    /// The ticker/interval has no bars.
    #[error("no data for request")]
    NoData,
    #[error("malformed payload: {0}")]
    Malformed(PayloadError),
    #[error("network error: {0}")]
    Network(String),
}

impl From<PayloadError> for FetchError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::NoBars => FetchError::NoData,
            other => FetchError::Malformed(other),
        }
    }
}

impl From<futures::future::Aborted> for FetchError {
    fn from(_: futures::future::Aborted) -> Self {
        FetchError::Aborted
    }
}

impl FetchError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, FetchError::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_maps_to_no_data() {
        assert_eq!(FetchError::from(PayloadError::NoBars), FetchError::NoData);
        assert!(matches!(
            FetchError::from(PayloadError::MissingField("bars")),
            FetchError::Malformed(_)
        ));
    }
}
