//! HTTP plumbing for the tus wire protocol.
//!
//! The engine drives an object-safe [`HttpTransport`] so protocol logic can
//! be exercised against scripted transports in tests; [`ReqwestTransport`]
//! is the production implementation backed by a shared [`reqwest::Client`].

use std::future::Future;
use std::pin::Pin;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::error::UploadError;

/// Protocol version sent with every request.
pub const TUS_VERSION: &str = "1.0.0";

/// Header carried by every tus request.
pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
/// Current byte offset of an upload, on HEAD/PATCH requests and responses.
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
/// Total upload length, sent on creation.
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
/// Encoded user metadata, sent on creation.
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
/// Upload URL minted by the server on creation.
pub const HEADER_LOCATION: &str = "Location";

/// Content type required for PATCH bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// One protocol request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a bodyless request.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Sets a header, replacing any previous value. Invalid names or values
    /// are rejected rather than sent.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), UploadError> {
        let name = HeaderName::try_from(name)
            .map_err(|e| UploadError::Transport(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UploadError::Transport(format!("invalid header value for {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Returns a request header as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One protocol response. tus clients only ever need status and headers.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl HttpResponse {
    /// Creates a headerless response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Returns a response header as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Abstract HTTP transport the engine sends requests through.
pub trait HttpTransport: Send + Sync {
    /// Sends one request and resolves with its response.
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + '_>>;
}

/// [`HttpTransport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing client (custom TLS, proxy, or timeout settings).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| UploadError::Transport(e.to_string()))?;
            Ok(HttpResponse {
                status: response.status(),
                headers: response.headers().clone(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Header value helpers
// ---------------------------------------------------------------------------

/// Takes the portion of a header value before the first comma.
///
/// Some servers return list-valued `Location`/`Upload-Offset` headers; the
/// first element is the one that matters.
pub(crate) fn truncate_at_comma(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

/// Parses a (possibly list-valued) `Upload-Offset` header value.
pub(crate) fn parse_offset(value: &str) -> Option<u64> {
    truncate_at_comma(value).parse().ok()
}

/// Resolves a `Location` header against the creation URI.
///
/// The value is comma-truncated, then parsed; relative references and
/// scheme/host-less values are resolved against `base`.
pub(crate) fn resolve_location(base: &Url, location: &str) -> Result<Url, UploadError> {
    let location = truncate_at_comma(location);
    if location.is_empty() {
        return Err(UploadError::Protocol {
            status: None,
            message: "empty Location header".into(),
        });
    }
    match Url::parse(location) {
        Ok(url) if url.has_host() => Ok(url),
        _ => base.join(location).map_err(|e| UploadError::Protocol {
            status: None,
            message: format!("unresolvable Location {location:?}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_first_element() {
        assert_eq!(truncate_at_comma("a,b,c"), "a");
        assert_eq!(truncate_at_comma(" 42 , 43"), "42");
        assert_eq!(truncate_at_comma("plain"), "plain");
        assert_eq!(truncate_at_comma(""), "");
    }

    #[test]
    fn parse_offset_handles_lists_and_garbage() {
        assert_eq!(parse_offset("524288"), Some(524288));
        assert_eq!(parse_offset("524288,524288"), Some(524288));
        assert_eq!(parse_offset(" 0 "), Some(0));
        assert_eq!(parse_offset("-1"), None);
        assert_eq!(parse_offset("abc"), None);
        assert_eq!(parse_offset(""), None);
    }

    #[test]
    fn resolve_absolute_location() {
        let base = Url::parse("https://tus.example/files/").unwrap();
        let url = resolve_location(&base, "https://cdn.example/files/abc").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/files/abc");
    }

    #[test]
    fn resolve_relative_location_against_creation_uri() {
        let base = Url::parse("https://tus.example/files/").unwrap();
        let url = resolve_location(&base, "abc").unwrap();
        assert_eq!(url.as_str(), "https://tus.example/files/abc");

        let url = resolve_location(&base, "/other/abc").unwrap();
        assert_eq!(url.as_str(), "https://tus.example/other/abc");
    }

    #[test]
    fn resolve_comma_truncates_first() {
        let base = Url::parse("https://tus.example/files/").unwrap();
        let url = resolve_location(&base, "abc,https://evil.example/x").unwrap();
        assert_eq!(url.as_str(), "https://tus.example/files/abc");
    }

    #[test]
    fn resolve_empty_location_is_protocol_error() {
        let base = Url::parse("https://tus.example/files/").unwrap();
        assert!(matches!(
            resolve_location(&base, ""),
            Err(UploadError::Protocol { .. })
        ));
    }

    #[test]
    fn request_header_roundtrip() {
        let mut request = HttpRequest::new(
            Method::PATCH,
            Url::parse("https://tus.example/files/abc").unwrap(),
        );
        request.set_header(HEADER_UPLOAD_OFFSET, "1024").unwrap();
        assert_eq!(request.header(HEADER_UPLOAD_OFFSET), Some("1024"));
        assert!(request.set_header("bad name", "v").is_err());
        assert!(request.set_header("X-Ok", "bad\nvalue").is_err());
    }
}
