//! Error types for the conversion service.
//!
//! A single `ServiceError` enum covers every failure the service can
//! surface: protocol-shape problems on the inbound connection, routing
//! misses, provider-level conversion failures, and upstream fetch errors.
//! The HTTP status mapping lives here too, but it is applied only at the
//! response-serialization boundary; everything below that layer works with
//! the error kind alone.

use std::io;

use thiserror::Error;

/// Unified error type for request handling and rate fetching.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Neither side of the requested pair resolves against the rate table.
    #[error("exchange rate for {0} is not supported")]
    CurrencyNotSupported(String),

    /// The amount segment does not parse as a decimal literal.
    #[error("amount of money is not correct")]
    AmountNotValid,

    /// The upstream rate service answered with a non-success status line.
    #[error("request to the {service} server failed, error {code}: {description}")]
    UpstreamStatus {
        service: &'static str,
        code: String,
        description: String,
    },

    /// Connecting to or exchanging bytes with the upstream failed.
    #[error("request to the {service} server failed: {source}")]
    UpstreamTransport {
        service: &'static str,
        #[source]
        source: io::Error,
    },

    /// The upstream payload violated its wire contract (bad nominal/value).
    #[error("malformed payload from the {service} server: {detail}")]
    UpstreamPayload {
        service: &'static str,
        detail: String,
    },

    /// The request line did not split into method, target, and version.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A recognized but unsupported method (anything other than GET).
    #[error("method {0} is not implemented")]
    MethodNotImplemented(String),

    /// The request carried a protocol version other than the supported one.
    #[error("protocol version {0} is not supported")]
    VersionNotSupported(String),

    /// Unknown service name or wrong path arity.
    #[error("not found")]
    NotFound,

    /// Anything unexpected; detail is logged, never sent to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Status code and reason phrase for the response status line.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            ServiceError::BadRequest(_) => (400, "Bad Request"),
            ServiceError::NotFound => (404, "Not Found"),
            ServiceError::MethodNotImplemented(_) => (501, "Not Implemented"),
            ServiceError::VersionNotSupported(_) => (505, "HTTP Version Not Supported"),
            ServiceError::CurrencyNotSupported(_)
            | ServiceError::AmountNotValid
            | ServiceError::UpstreamStatus { .. }
            | ServiceError::UpstreamTransport { .. }
            | ServiceError::UpstreamPayload { .. }
            | ServiceError::Internal(_) => (500, "Internal Server Error"),
        }
    }

    /// Message included in the error response body.
    ///
    /// `Internal` returns `None`: its detail goes to the log, and the client
    /// sees only the generic status reason.
    pub fn client_message(&self) -> Option<String> {
        match self {
            ServiceError::Internal(_) => None,
            other => Some(other.to_string()),
        }
    }

    /// True for kinds that are logged as server-side failures rather than
    /// client mistakes.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            ServiceError::UpstreamStatus { .. }
                | ServiceError::UpstreamTransport { .. }
                | ServiceError::UpstreamPayload { .. }
                | ServiceError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::BadRequest("x".into()).status(),
            (400, "Bad Request")
        );
        assert_eq!(ServiceError::NotFound.status(), (404, "Not Found"));
        assert_eq!(
            ServiceError::MethodNotImplemented("POST".into()).status().0,
            501
        );
        assert_eq!(
            ServiceError::VersionNotSupported("HTTP/1.0".into()).status().0,
            505
        );
        assert_eq!(
            ServiceError::CurrencyNotSupported("xyz".into()).status().0,
            500
        );
        assert_eq!(ServiceError::AmountNotValid.status().0, 500);
        assert_eq!(ServiceError::Internal("boom".into()).status().0, 500);
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = ServiceError::Internal("lock poisoned at rates/mod.rs".into());
        assert_eq!(err.client_message(), None);

        let err = ServiceError::CurrencyNotSupported("xyz".into());
        assert_eq!(
            err.client_message().as_deref(),
            Some("exchange rate for xyz is not supported")
        );
    }

    #[test]
    fn test_server_fault_classification() {
        assert!(ServiceError::Internal("x".into()).is_server_fault());
        assert!(ServiceError::UpstreamPayload {
            service: "cbr",
            detail: "bad value".into()
        }
        .is_server_fault());
        assert!(!ServiceError::NotFound.is_server_fault());
        assert!(!ServiceError::BadRequest("x".into()).is_server_fault());
    }
}
