use tracing::warn;

use crate::error::FetchError;

/// What the view does after a failed primary load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResolution {
    /// Superseded request; nothing to show.
    Ignore,
    /// Keep the cached render and suppress the error.
    KeepStale,
    /// Blank the panes and show the invalid-symbol state.
    InvalidSymbol,
    /// Show a retry affordance that re-issues the same request.
    OfferRetry { message: String },
}

pub fn resolve_failure(err: &FetchError, has_cached: bool) -> FailureResolution {
    match err {
        FetchError::Aborted => FailureResolution::Ignore,
        FetchError::NoData => FailureResolution::InvalidSymbol,
        FetchError::Malformed(detail) => {
            warn!(error = %detail, "malformed chart payload");
            FailureResolution::InvalidSymbol
        }
        FetchError::Network(_) if has_cached => FailureResolution::KeepStale,
        FetchError::Network(message) => FailureResolution::OfferRetry {
            message: message.clone(),
        },
    }
}
