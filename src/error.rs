use cdp_proto::remote_error_codes;

/// Client error taxonomy.
///
/// Variants carry plain strings so that one failure can be cloned out to
/// every waiter of the pending-request set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport open/close/error surfaced without an auto-reconnect in
    /// progress.
    #[error("connection error: {0}")]
    Connection(String),
    /// Protocol mismatch or an unsupported container type.
    #[error("communication error: {0}")]
    Communication(String),
    /// The server rejected a request as invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// `child(name)` against a name absent from the local cache.
    #[error("not found: {0}")]
    NotFound(String),
    /// Embedder-layer misuse, e.g. credentials missing a required key.
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Map a remote error report to the local taxonomy.
    pub(crate) fn from_remote(code: &str, text: &str) -> Option<Error> {
        match code {
            remote_error_codes::INVALID_REQUEST => Some(Error::InvalidRequest(text.to_owned())),
            remote_error_codes::UNSUPPORTED_CONTAINER_TYPE => {
                Some(Error::Communication(text.to_owned()))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
