use thiserror::Error;

/// Failures reported by, or while talking to, the trading service.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("http error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("api error: {0}")]
    Api(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}
