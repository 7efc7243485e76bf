// =============================================================================
// Venue error taxonomy
// =============================================================================
//
// The executor branches on *why* a venue call failed, not just that it did.
// `VenueUnreachable` (transport-level) triggers retry + a red "connection
// lost" notification; `VenueRejected` (the venue's own 4xx body) is terminal
// for that call; `Inconsistent` means a pre-flight query itself failed and
// the caller must never proceed under uncertainty.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue unreachable: {0}")]
    Unreachable(String),

    #[error("venue rejected request: {0}")]
    Rejected(String),

    #[error("pre-flight query inconsistent: {0}")]
    Inconsistent(String),
}

impl VenueError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, VenueError::Unreachable(_))
    }
}

pub type VenueResult<T> = Result<T, VenueError>;
