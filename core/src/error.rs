use firstfail_async_utils::CancelErr;
use thiserror::Error;

/// Result alias used throughout `firstfail-core`.
pub type Result<T> = std::result::Result<T, FirstFailError>;

/// Error taxonomy for the bisection engine and its collaborators.
///
/// Lower layers fail fast with the most specific variant. Only
/// [`FirstFailError::Transport`] is considered transient.
#[derive(Debug, Error)]
pub enum FirstFailError {
    /// Malformed manifest, tag payload, timestamp or persisted snapshot.
    #[error("parse error: {0}")]
    Parse(String),

    /// Network or child-process failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// External cancellation. Callers must not retry.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline elapsed while waiting on a device, process or service.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),

    /// Invariant violation, e.g. an inverted time window.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FirstFailError {
    /// True for failures worth exactly one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FirstFailError::Transport(_))
    }

    /// True when the failure came from cancellation or an expired deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            FirstFailError::Cancelled | FirstFailError::DeadlineExceeded(_)
        )
    }
}

impl From<CancelErr> for FirstFailError {
    fn from(err: CancelErr) -> Self {
        match err {
            CancelErr::Cancelled => FirstFailError::Cancelled,
            CancelErr::DeadlineExceeded(d) => FirstFailError::DeadlineExceeded(d),
        }
    }
}

impl From<reqwest::Error> for FirstFailError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FirstFailError::Parse(err.to_string())
        } else {
            FirstFailError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FirstFailError {
    fn from(err: serde_json::Error) -> Self {
        FirstFailError::Parse(err.to_string())
    }
}

impl From<quick_xml::Error> for FirstFailError {
    fn from(err: quick_xml::Error) -> Self {
        FirstFailError::Parse(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for FirstFailError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        FirstFailError::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for FirstFailError {
    fn from(err: toml::de::Error) -> Self {
        FirstFailError::Config(err.to_string())
    }
}
