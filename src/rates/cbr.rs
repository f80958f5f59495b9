//! Upstream rate fetcher for the Central Bank of Russia daily feed.
//!
//! The exchange is a single shot over a raw socket: write a fixed
//! three-line request, read one status line, discard headers, read the
//! one-line body. The endpoint URL decides the transport: `https` gets TLS
//! on port 443, `http` plaintext on port 80 (an explicit port wins).
//!
//! ## Payload wire contract
//!
//! The body is Windows-1251 text containing repeated groups of
//!
//! ```text
//! <CharCode>USD</CharCode><Nominal>1</Nominal> ... <Value>90,1234</Value>
//! ```
//!
//! Field grammar, kept exactly as the upstream emits it: the code is
//! alphanumeric, the nominal is a digit run, the value is digits with a
//! comma decimal separator. `Nominal` follows `CharCode` immediately;
//! `Value` follows at any distance. Groups that do not fit this shape are
//! not matches and are ignored; a matched group whose numbers fail to
//! parse (or produce a non-positive rate) fails the whole refresh.
//!
//! Each matched rate is stored as `value / nominal` under the lower-cased
//! code, all keyed by the ruble as the reference currency.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::mem::decode_latin1;
use encoding_rs::WINDOWS_1251;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::{RateFetcher, RateTable};
use crate::error::ServiceError;

/// Service label used in error messages.
const SERVICE: &str = "CBR";

/// All stored rates are quoted against the ruble.
const REFERENCE_CURRENCY: &str = "rub";

/// Fetcher for the CBR endpoint, configured once at construction.
pub struct CbrFetcher {
    host: String,
    port: u16,
    /// Prebuilt request bytes: request line, Host header, blank line.
    request: Vec<u8>,
    /// TLS connector and server name, present iff the scheme is `https`.
    tls: Option<(TlsConnector, ServerName<'static>)>,
    /// Cap on the whole connect/exchange sequence; zero disables it.
    timeout: Duration,
}

impl CbrFetcher {
    /// Resolve the endpoint URL into host, port, transport, and request
    /// bytes.
    pub fn new(endpoint: &str, exchange_timeout: Duration) -> Result<Self, ServiceError> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| ServiceError::Internal(format!("invalid upstream url: {}", e)))?;

        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ServiceError::Internal(format!(
                    "unsupported upstream scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ServiceError::Internal("upstream url has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\n\r\n",
            url.path(),
            host
        )
        .into_bytes();

        let tls = if secure {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let name = ServerName::try_from(host.clone())
                .map_err(|e| ServiceError::Internal(format!("invalid upstream host: {}", e)))?;
            Some((TlsConnector::from(Arc::new(config)), name))
        } else {
            None
        };

        Ok(CbrFetcher {
            host,
            port,
            request,
            tls,
            timeout: exchange_timeout,
        })
    }

    fn transport(source: io::Error) -> ServiceError {
        ServiceError::UpstreamTransport {
            service: SERVICE,
            source,
        }
    }

    fn payload(detail: impl Into<String>) -> ServiceError {
        ServiceError::UpstreamPayload {
            service: SERVICE,
            detail: detail.into(),
        }
    }

    async fn connect_and_exchange(&self) -> Result<RateTable, ServiceError> {
        info!(host = %self.host, port = self.port, "Fetching exchange rates");

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(Self::transport)?;

        match &self.tls {
            Some((connector, name)) => {
                let stream = connector
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(Self::transport)?;
                self.exchange(stream).await
            }
            None => self.exchange(tcp).await,
        }
    }

    /// Write the request and frame the response: status line, headers,
    /// one-line body.
    async fn exchange<S>(&self, stream: S) -> Result<RateTable, ServiceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(stream);
        stream
            .write_all(&self.request)
            .await
            .map_err(Self::transport)?;
        stream.flush().await.map_err(Self::transport)?;

        let mut line = Vec::new();
        stream
            .read_until(b'\n', &mut line)
            .await
            .map_err(Self::transport)?;

        let status = decode_latin1(&line);
        let mut tokens = status.split_whitespace();
        let (code, description) = match (tokens.next(), tokens.next()) {
            (Some(_proto), Some(code)) => {
                (code.to_string(), tokens.collect::<Vec<_>>().join(" "))
            }
            _ => return Err(Self::payload(format!("malformed status line: {:?}", status))),
        };

        if code != "200" {
            return Err(ServiceError::UpstreamStatus {
                service: SERVICE,
                code,
                description,
            });
        }

        // Skip header lines up to the blank separator.
        loop {
            line.clear();
            let n = stream
                .read_until(b'\n', &mut line)
                .await
                .map_err(Self::transport)?;
            if n == 0 || line.as_slice() == b"\r\n" || line.as_slice() == b"\n" {
                break;
            }
        }

        // The upstream emits its whole payload as one line.
        let mut body = Vec::new();
        stream
            .read_until(b'\n', &mut body)
            .await
            .map_err(Self::transport)?;

        let (body, _, _) = WINDOWS_1251.decode(&body);
        let rates = extract_rates(&body)?;
        debug!(rates = rates.len(), "Extracted rate records");

        Ok(RateTable::single(REFERENCE_CURRENCY, rates))
    }
}

#[async_trait]
impl RateFetcher for CbrFetcher {
    async fn fetch(&self) -> Result<RateTable, ServiceError> {
        if self.timeout.is_zero() {
            return self.connect_and_exchange().await;
        }
        match timeout(self.timeout, self.connect_and_exchange()).await {
            Ok(result) => result,
            Err(_) => Err(Self::transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream exchange timed out",
            ))),
        }
    }
}

/// Scan the body for `(CharCode, Nominal, Value)` groups and compute
/// per-unit rates.
///
/// Zero matches is not an error; the resulting empty table simply supports
/// no currency. A matched group with a malformed number or a non-positive
/// rate fails the refresh, never gets skipped.
fn extract_rates(
    body: &str,
) -> Result<std::collections::HashMap<String, Decimal>, ServiceError> {
    let mut rates = std::collections::HashMap::new();

    let mut rest = body;
    while let Some(start) = rest.find("<CharCode>") {
        rest = &rest[start + "<CharCode>".len()..];

        let Some((code, after_code)) = take_field(rest, "</CharCode>") else {
            break;
        };
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }

        // Nominal must follow the code immediately; anything else is not a
        // match and the scan moves on.
        let Some(after_tag) = after_code.strip_prefix("<Nominal>") else {
            continue;
        };
        let Some((nominal, after_nominal)) = take_field(after_tag, "</Nominal>") else {
            break;
        };
        if nominal.is_empty() || !nominal.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        let Some(value_start) = after_nominal.find("<Value>") else {
            continue;
        };
        let Some((value, after_value)) =
            take_field(&after_nominal[value_start + "<Value>".len()..], "</Value>")
        else {
            break;
        };
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit() || b == b',') {
            continue;
        }

        let nominal: Decimal = nominal
            .parse()
            .map_err(|_| CbrFetcher::payload(format!("bad nominal {:?}", nominal)))?;
        let value: Decimal = value
            .replace(',', ".")
            .parse()
            .map_err(|_| CbrFetcher::payload(format!("bad value {:?}", value)))?;

        if nominal.is_zero() {
            return Err(CbrFetcher::payload(format!("zero nominal for {}", code)));
        }
        let rate = value / nominal;
        if rate <= Decimal::ZERO {
            return Err(CbrFetcher::payload(format!(
                "non-positive rate for {}",
                code
            )));
        }

        rates.insert(code.to_lowercase(), rate);
        rest = after_value;
    }

    Ok(rates)
}

/// Split off the text before `close`, returning it with the remainder.
fn take_field<'a>(input: &'a str, close: &str) -> Option<(&'a str, &'a str)> {
    let end = input.find(close)?;
    Some((&input[..end], &input[end + close.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const BODY: &str = "<?xml version=\"1.0\"?><ValCurs Date=\"07.08.2026\" name=\"Foreign Currency Market\">\
        <Valute ID=\"R01235\"><NumCode>840</NumCode><CharCode>USD</CharCode><Nominal>1</Nominal>\
        <Name>Доллар США</Name><Value>90,1234</Value></Valute>\
        <Valute ID=\"R01375\"><NumCode>156</NumCode><CharCode>CNY</CharCode><Nominal>10</Nominal>\
        <Name>Китайских юаней</Name><Value>125,5000</Value></Valute></ValCurs>";

    #[test]
    fn test_extract_rates() {
        let rates = extract_rates(BODY).unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates["usd"], "90.1234".parse().unwrap());
        // Nominal 10 divides the quoted value.
        assert_eq!(rates["cny"], "12.55".parse().unwrap());
    }

    #[test]
    fn test_extract_no_matches_is_empty() {
        let rates = extract_rates("<html>maintenance page</html>").unwrap();
        assert!(rates.is_empty());
    }

    #[test]
    fn test_extract_skips_nonmatching_group() {
        // A value outside the digits-and-comma grammar is not a match.
        let body = "<CharCode>BAD</CharCode><Nominal>1</Nominal><Value>N/A</Value>\
                    <CharCode>USD</CharCode><Nominal>1</Nominal><Value>90,00</Value>";
        let rates = extract_rates(body).unwrap();
        assert_eq!(rates.len(), 1);
        assert!(rates.contains_key("usd"));
    }

    #[test]
    fn test_extract_rejects_malformed_value() {
        // Grammar-valid but not a decimal: two comma separators.
        let body = "<CharCode>USD</CharCode><Nominal>1</Nominal><Value>90,12,34</Value>";
        match extract_rates(body) {
            Err(ServiceError::UpstreamPayload { detail, .. }) => {
                assert!(detail.contains("90,12,34"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_extract_rejects_zero_nominal() {
        let body = "<CharCode>USD</CharCode><Nominal>0</Nominal><Value>90,00</Value>";
        match extract_rates(body) {
            Err(ServiceError::UpstreamPayload { detail, .. }) => {
                assert!(detail.contains("zero nominal"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_extract_rejects_zero_value() {
        let body = "<CharCode>USD</CharCode><Nominal>1</Nominal><Value>0,0000</Value>";
        assert!(matches!(
            extract_rates(body),
            Err(ServiceError::UpstreamPayload { .. })
        ));
    }

    /// Serve one canned response on a local listener, return its address.
    async fn mock_upstream(status_line: &str, body: &str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status_line = status_line.to_string();
        let body = body.to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            // Drain the request so the peer is not reset mid-write.
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await;

            // Writes may fail once the fetcher bails out early (e.g. on a
            // non-success status); that is the peer's business.
            let (encoded_body, _, _) = WINDOWS_1251.encode(&body);
            let _ = writer.write_all(status_line.as_bytes()).await;
            let _ = writer
                .write_all(b"Content-Type: application/xml; charset=windows-1251\r\n")
                .await;
            let _ = writer.write_all(b"Server: mock\r\n\r\n").await;
            let _ = writer.write_all(&encoded_body).await;
            let _ = writer.write_all(b"\n").await;
        });

        addr
    }

    fn fetcher_for(addr: std::net::SocketAddr) -> CbrFetcher {
        CbrFetcher::new(
            &format!("http://{}/scripts/XML_daily.asp", addr),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_from_mock_upstream() {
        let addr = mock_upstream("HTTP/1.1 200 OK\r\n", BODY).await;
        let table = fetcher_for(addr).fetch().await.unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.rate("usd", "rub").unwrap(),
            "90.1234".parse().unwrap()
        );
        assert_eq!(table.rate("cny", "rub").unwrap(), "12.55".parse().unwrap());
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_success_status() {
        let addr = mock_upstream("HTTP/1.1 404 Not Found\r\n", "").await;
        match fetcher_for(addr).fetch().await {
            Err(ServiceError::UpstreamStatus {
                code, description, ..
            }) => {
                assert_eq!(code, "404");
                assert_eq!(description, "Not Found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_transport_error() {
        // Bind to learn a free port, then close it before fetching.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match fetcher_for(addr).fetch().await {
            Err(ServiceError::UpstreamTransport { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        // Accept and then stay silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let fetcher = CbrFetcher::new(
            &format!("http://{}/scripts/XML_daily.asp", addr),
            Duration::from_secs(1),
        )
        .unwrap();

        match fetcher.fetch().await {
            Err(ServiceError::UpstreamTransport { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_new_rejects_bad_endpoint() {
        assert!(CbrFetcher::new("ftp://example.com/x", Duration::ZERO).is_err());
        assert!(CbrFetcher::new("not a url", Duration::ZERO).is_err());
    }

    #[test]
    fn test_request_bytes_shape() {
        let fetcher =
            CbrFetcher::new("https://www.cbr.ru/scripts/XML_daily.asp", Duration::ZERO).unwrap();
        assert_eq!(
            fetcher.request,
            b"GET /scripts/XML_daily.asp HTTP/1.0\r\nHost: www.cbr.ru\r\n\r\n"
        );
        assert_eq!(fetcher.port, 443);
        assert!(fetcher.tls.is_some());
    }
}
