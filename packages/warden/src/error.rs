//! Error taxonomy shared by the core managers.
//!
//! The API layer maps these kinds onto HTTP status codes; manager internals
//! that don't cross the API boundary keep using `color_eyre::Result`.

use derive_more::{Display, Error};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Malformed input, detected without touching any state.
    #[display("{message}")]
    InvalidArgument { message: String },

    /// The referenced entity does not exist.
    #[display("{message}")]
    NotFound { message: String },

    /// Well-formed input the system cannot honour in its current state.
    #[display("{message}")]
    InvalidState { message: String },

    /// An underlying OS or network call failed.
    #[display("{message}")]
    ResourceFailure { message: String },

    /// A bounded wait elapsed. Where the operation allows it, this surfaces
    /// as a non-fatal "poll me" outcome instead of an error response.
    #[display("timed out: {message}")]
    Timeout { message: String },

    /// A language server returned an RPC error or unparseable output.
    #[display("language server error ({code}): {message}")]
    PeerProtocol { code: i64, message: String },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::ResourceFailure {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn peer_protocol(code: i64, message: impl Into<String>) -> Self {
        Self::PeerProtocol {
            code,
            message: message.into(),
        }
    }
}
