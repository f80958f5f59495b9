//! HTTP/1.1 subset: request-line parsing and response framing.
//!
//! The service speaks a deliberately small slice of HTTP:
//! - exactly one CR-LF terminated request line per connection,
//! - `GET` only, `HTTP/1.1` only,
//! - one framed JSON response, then the connection closes.
//!
//! Request headers are never read or validated. That is a protocol-subset
//! limitation, not an oversight: the request line alone carries everything
//! the service needs, and the connection is closed after a single exchange.
//!
//! ## Response format
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: application/json; charset=utf-8\r\n
//! Content-Length: <bytes>\r\n
//! \r\n
//! {"status":"success","result":{...}}
//! ```
//!
//! Non-200 responses wrap the message as
//! `{"status":"error","message":"..."}`.

use bytes::BytesMut;
use encoding_rs::mem::decode_latin1;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::info;

use crate::error::ServiceError;

/// The single supported protocol version literal.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Header sent with every response.
const CONTENT_TYPE: &str = "Content-Type: application/json; charset=utf-8";

/// A parsed request line. Immutable once built, scoped to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
}

/// Read and validate one request line from the connection.
///
/// The line is decoded as Latin-1 (single byte per character, the encoding
/// HTTP request lines are defined over) and split on whitespace into exactly
/// three tokens. Only the path component of the target is retained; query
/// and fragment are dropped.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ServiceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ServiceError::Internal(format!("request read failed: {}", e)))?;

    if n == 0 {
        // Peer closed before sending anything.
        return Err(ServiceError::BadRequest("empty request".to_string()));
    }

    let line = decode_latin1(&line);
    let line = line.trim_end_matches(['\r', '\n']);

    info!(request_line = %line, "Request");

    let mut tokens = line.split_whitespace();
    let (method, target, version) =
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(target), Some(version), None) => (method, target, version),
            _ => return Err(ServiceError::BadRequest(line.to_string())),
        };

    if version != HTTP_VERSION {
        return Err(ServiceError::VersionNotSupported(version.to_string()));
    }

    // Every non-GET method is recognized and rejected explicitly; POST and
    // friends must not fall through as if they were reads.
    if method != "GET" {
        return Err(ServiceError::MethodNotImplemented(method.to_string()));
    }

    let path = target
        .split(['?', '#'])
        .next()
        .unwrap_or(target)
        .to_string();

    Ok(Request {
        method: method.to_string(),
        path,
        version: version.to_string(),
    })
}

/// Body carried by a response.
#[derive(Debug, Clone, PartialEq)]
enum Body {
    /// Structured success payload, wrapped under `result`.
    Result(Value),
    /// Error message, wrapped under `message`.
    Message(String),
    /// No message; the status reason stands in.
    Empty,
}

/// A response ready for serialization: status line, fixed headers, JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    code: u16,
    reason: &'static str,
    body: Body,
}

impl Response {
    /// A 200 response wrapping the given payload as the conversion result.
    pub fn success(result: Value) -> Self {
        Response {
            code: 200,
            reason: "OK",
            body: Body::Result(result),
        }
    }

    /// An error response for the given status, with an optional message.
    pub fn error(code: u16, reason: &'static str, message: Option<String>) -> Self {
        Response {
            code,
            reason,
            body: match message {
                Some(msg) => Body::Message(msg),
                None => Body::Empty,
            },
        }
    }

    /// The error response mapped from a `ServiceError`.
    pub fn from_error(err: &ServiceError) -> Self {
        let (code, reason) = err.status();
        Response::error(code, reason, err.client_message())
    }

    /// Serialize into framed bytes: status line, headers, blank line, body.
    ///
    /// `Content-Length` is computed from the encoded body bytes, never
    /// estimated, so multi-byte characters in messages cannot truncate the
    /// frame.
    pub fn encode(&self) -> BytesMut {
        let payload = match &self.body {
            Body::Result(result) => json!({ "status": "success", "result": result }),
            Body::Message(message) => json!({ "status": "error", "message": message }),
            Body::Empty => json!({ "status": "error", "message": self.reason }),
        };
        let body = payload.to_string();

        let mut out = BytesMut::with_capacity(128 + body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", HTTP_VERSION, self.code, self.reason).as_bytes(),
        );
        out.extend_from_slice(CONTENT_TYPE.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body.as_bytes());
        out
    }
}
