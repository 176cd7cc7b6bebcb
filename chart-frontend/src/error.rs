use thiserror::Error;

use crate::surface::SurfaceError;
use crate::PaneRole;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("session has been torn down")]
    Destroyed,
    #[error("{0:?} pane is not bound")]
    NotBound(PaneRole),
    #[error("{0:?} pane does not carry trendlines")]
    NotAnOscillator(PaneRole),
    #[error("invalid configuration: {0}")]
    Config(String),
}
