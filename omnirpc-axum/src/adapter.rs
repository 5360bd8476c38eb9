//! Protocol adapters: claiming transport requests for one wire protocol.
//!
//! Adapters are tried in a fixed priority order — binary first, then the
//! base64 text variant, then REST transcoding, then JSON-RPC envelopes —
//! so exactly one adapter claims any given request. Claiming inspects only
//! the request head (verb, path, headers); the body is consumed later by
//! the claiming protocol's frame codec.

use std::collections::HashSet;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::request::Parts;
use omnirpc_axum_core::{ContentEncoding, WireFormat};

use crate::transcoding::{PathMatch, PathMatcher};

/// Content type of the binary protocol (`application/grpc[+proto|+json]`).
pub const CONTENT_TYPE_BINARY: &str = "application/grpc";
/// Content type of the base64 text variant.
pub const CONTENT_TYPE_WEB_TEXT: &str = "application/grpc-web-text";
/// Content type of transcoded REST requests.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type of JSON-RPC envelope requests.
pub const CONTENT_TYPE_JSON_RPC: &str = "application/json-rpc";

/// Request header carrying the message content encoding.
pub const ENCODING_HEADER: &str = "grpc-encoding";
/// Request header carrying the call deadline.
pub const TIMEOUT_HEADER: &str = "grpc-timeout";

/// The wire protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Length-prefixed binary framing over POST.
    Binary,
    /// The same framing, base64-wrapped for browsers.
    WebText,
    /// REST/JSON requests routed by path templates.
    Transcoding,
    /// JSON-RPC 2.0 envelopes POSTed to the service path.
    JsonRpc,
}

/// Fixed adapter priority: the first claim wins.
pub(crate) const ADAPTER_PRIORITY: [Protocol; 4] = [
    Protocol::Binary,
    Protocol::WebText,
    Protocol::Transcoding,
    Protocol::JsonRpc,
];

/// A claimed request, carrying the wiring the dispatcher needs.
pub(crate) enum Accepted {
    /// Binary or text framing addressed by canonical method path.
    Framed {
        protocol: Protocol,
        method_path: String,
        format: WireFormat,
        encoding: ContentEncoding,
        timeout: Option<Duration>,
        content_type: &'static str,
    },
    /// A transcoded REST request resolved through the path matcher.
    Transcoded { matched: PathMatch },
    /// A JSON-RPC envelope addressed to one registered service.
    Envelope { service: String },
}

impl Protocol {
    /// Offer the request head to this adapter; `Some` claims it.
    pub(crate) fn try_accept(
        &self,
        parts: &Parts,
        matcher: &PathMatcher,
        services: &HashSet<String>,
    ) -> Option<Accepted> {
        match self {
            Protocol::Binary => try_accept_framed(
                parts,
                CONTENT_TYPE_BINARY,
                Protocol::Binary,
                // `application/grpc-web*` belongs to the text adapter.
                |ct| ct.starts_with("application/grpc-web"),
            ),
            Protocol::WebText => {
                try_accept_framed(parts, CONTENT_TYPE_WEB_TEXT, Protocol::WebText, |_| false)
            }
            Protocol::Transcoding => {
                if !json_compatible(parts, false) {
                    return None;
                }
                let matched =
                    matcher.lookup(&parts.method, parts.uri.path(), parts.uri.query())?;
                Some(Accepted::Transcoded { matched })
            }
            Protocol::JsonRpc => {
                if parts.method != http::Method::POST || !json_compatible(parts, true) {
                    return None;
                }
                let service = parts.uri.path().trim_start_matches('/');
                if service.is_empty() || !services.contains(service) {
                    return None;
                }
                Some(Accepted::Envelope {
                    service: service.to_string(),
                })
            }
        }
    }
}

fn try_accept_framed(
    parts: &Parts,
    prefix: &str,
    protocol: Protocol,
    exclude: impl Fn(&str) -> bool,
) -> Option<Accepted> {
    if parts.method != http::Method::POST {
        return None;
    }
    let content_type = parts.headers.get(CONTENT_TYPE)?.to_str().ok()?;
    if !content_type.starts_with(prefix) || exclude(content_type) {
        return None;
    }

    let format = if content_type.contains("+json") {
        WireFormat::Json
    } else {
        WireFormat::Binary
    };

    let encoding = parts
        .headers
        .get(ENCODING_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentEncoding::parse)
        .unwrap_or_default();

    let timeout = parts
        .headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_timeout);

    let content_type = match (protocol, format) {
        (Protocol::Binary, WireFormat::Json) => "application/grpc+json",
        (Protocol::Binary, _) => "application/grpc+proto",
        (_, WireFormat::Json) => "application/grpc-web-text+json",
        (_, _) => "application/grpc-web-text+proto",
    };

    Some(Accepted::Framed {
        protocol,
        method_path: parts.uri.path().to_string(),
        format,
        encoding,
        timeout,
        content_type,
    })
}

/// Whether the request's content type is JSON-compatible. Requests without
/// a body (GET, DELETE) typically carry no content type at all.
fn json_compatible(parts: &Parts, allow_json_rpc: bool) -> bool {
    match parts.headers.get(CONTENT_TYPE) {
        None => parts.method == http::Method::GET || parts.method == http::Method::DELETE,
        Some(value) => match value.to_str() {
            Ok(ct) => {
                if ct.starts_with(CONTENT_TYPE_JSON_RPC) {
                    allow_json_rpc
                } else {
                    ct.starts_with(CONTENT_TYPE_JSON)
                }
            }
            Err(_) => false,
        },
    }
}

/// Parse a `grpc-timeout`-style deadline: an integer followed by a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub(crate) fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoding::PathMatcherBuilder;

    fn parts(method: &str, path: &str, content_type: Option<&str>) -> Parts {
        let mut builder = http::Request::builder().method(method).uri(path);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn empty_matcher() -> PathMatcher {
        PathMatcherBuilder::new().build().unwrap()
    }

    fn services(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_binary_claims_grpc_content_type() {
        let parts = parts("POST", "/echo.Echo/Ping", Some("application/grpc+proto"));
        let accepted = Protocol::Binary
            .try_accept(&parts, &empty_matcher(), &services(&[]))
            .unwrap();

        let Accepted::Framed {
            protocol,
            method_path,
            format,
            ..
        } = accepted
        else {
            panic!("expected framed claim");
        };
        assert_eq!(protocol, Protocol::Binary);
        assert_eq!(method_path, "/echo.Echo/Ping");
        assert_eq!(format, WireFormat::Binary);
    }

    #[test]
    fn test_binary_ignores_web_text() {
        let parts = parts("POST", "/echo.Echo/Ping", Some("application/grpc-web-text"));
        assert!(
            Protocol::Binary
                .try_accept(&parts, &empty_matcher(), &services(&[]))
                .is_none()
        );
        assert!(
            Protocol::WebText
                .try_accept(&parts, &empty_matcher(), &services(&[]))
                .is_some()
        );
    }

    #[test]
    fn test_binary_json_suffix_selects_json_format() {
        let parts = parts("POST", "/echo.Echo/Ping", Some("application/grpc+json"));
        let Some(Accepted::Framed { format, .. }) =
            Protocol::Binary.try_accept(&parts, &empty_matcher(), &services(&[]))
        else {
            panic!("expected claim");
        };
        assert_eq!(format, WireFormat::Json);
    }

    #[test]
    fn test_transcoding_requires_template_match() {
        let mut builder = PathMatcherBuilder::new();
        builder
            .register(
                http::Method::GET,
                "/v1/shelves/{shelf}",
                None,
                None,
                "/library.Shelves/Get",
            )
            .unwrap();
        let matcher = builder.build().unwrap();

        let hit = parts("GET", "/v1/shelves/5", None);
        assert!(
            Protocol::Transcoding
                .try_accept(&hit, &matcher, &services(&[]))
                .is_some()
        );

        let miss = parts("GET", "/v1/drawers/5", None);
        assert!(
            Protocol::Transcoding
                .try_accept(&miss, &matcher, &services(&[]))
                .is_none()
        );
    }

    #[test]
    fn test_json_rpc_claims_registered_service_path() {
        let svc = services(&["echo.Echo"]);

        let hit = parts("POST", "/echo.Echo", Some("application/json"));
        let Some(Accepted::Envelope { service }) =
            Protocol::JsonRpc.try_accept(&hit, &empty_matcher(), &svc)
        else {
            panic!("expected envelope claim");
        };
        assert_eq!(service, "echo.Echo");

        let unknown = parts("POST", "/other.Service", Some("application/json"));
        assert!(
            Protocol::JsonRpc
                .try_accept(&unknown, &empty_matcher(), &svc)
                .is_none()
        );

        let wrong_ct = parts("POST", "/echo.Echo", Some("text/plain"));
        assert!(
            Protocol::JsonRpc
                .try_accept(&wrong_ct, &empty_matcher(), &svc)
                .is_none()
        );
    }

    #[test]
    fn test_parse_timeout_units() {
        assert_eq!(parse_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_timeout("45S"), Some(Duration::from_secs(45)));
        assert_eq!(parse_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_timeout("250u"), Some(Duration::from_micros(250)));
        assert_eq!(parse_timeout("999n"), Some(Duration::from_nanos(999)));
        assert_eq!(parse_timeout("100"), None);
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("abcS"), None);
    }
}
