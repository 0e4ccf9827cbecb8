use thiserror::Error;

pub type Result<T> = std::result::Result<T, NominatimError>;

#[derive(Debug, Error)]
pub enum NominatimError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("No result: {0}")]
    NoResult(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for NominatimError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            NominatimError::Parse(err.to_string())
        } else {
            NominatimError::Network(err.to_string())
        }
    }
}
