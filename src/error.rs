// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Error taxonomy shared by every component of the anchoring core.
///
/// The split that matters operationally is transient versus everything else:
/// pub/sub consumers redeliver on [`Error::is_transient`] and acknowledge
/// (dropping or recording the message) on any other kind.
#[derive(Debug, Error)]
pub enum Error {
    /// Infrastructure failure (network, broker, CAS, storage timeout) that is
    /// expected to succeed on redelivery.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed or unacceptable input. Never redelivered.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Signature verification or actor policy failure.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Distinguishable miss from a store or the CAS.
    #[error("not found: {0}")]
    NotFound(String),

    /// No parser or processor is registered for the requested
    /// namespace/version pair.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("not started")]
    NotStarted,

    #[error("already stopped")]
    AlreadyStopped,

    /// Intermediate state of a witness record, not a failure of the caller.
    #[error("witness policy not satisfied")]
    WitnessPolicyNotSatisfied,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Whether a pub/sub consumer should nack the message that produced this
    /// error and let it be redelivered.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

// Wire and transport conversions keep the taxonomy intact: parse failures are
// permanent, transport failures are retryable.
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::transient("broker down").is_transient());
        assert!(!Error::bad_request("no id").is_transient());
        assert!(!Error::NotStarted.is_transient());
        assert!(Error::not_found("x").is_not_found());
    }

    #[test]
    fn wire_errors_are_permanent() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(!err.is_transient());
    }
}
