//! Backend proxy for verified, settled requests.

use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use x402_core::{RouteDescriptor, HEADER_PAYER, HEADER_PAYMENT_RESPONSE};

use crate::cors;
use crate::error::GatewayError;
use crate::middleware::PaymentContext;

/// Headers never forwarded upstream: hop-by-hop plumbing, payment envelopes,
/// and client credentials that must not leak to the backend.
const HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "payment-signature",
    "x-payment",
    "authorization",
    "cookie",
    "proxy-authorization",
    "x-api-key",
    "x-x402-payer",
];

/// Response headers forwarded back from the backend. Everything else
/// (Server, X-Powered-By, internal headers) is dropped.
const ALLOWED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "vary",
    "x-request-id",
];

/// Reject path traversal and URL authority injection in the proxied tail.
fn sanitize_tail(tail: &str) -> Result<&str, GatewayError> {
    if tail.contains("..") || tail.starts_with('/') || tail.contains('@') {
        return Err(GatewayError::ProxyError(
            "path contains forbidden sequences".to_string(),
        ));
    }
    Ok(tail)
}

/// Reject CRLF and null bytes, strip fragments.
fn sanitize_query(query: &str) -> Result<String, GatewayError> {
    if query.contains('\r') || query.contains('\n') || query.contains('\0') {
        return Err(GatewayError::ProxyError(
            "query string contains forbidden characters".to_string(),
        ));
    }
    let sanitized = match query.find('#') {
        Some(idx) => &query[..idx],
        None => query,
    };
    Ok(sanitized.to_string())
}

fn target_url(route: &RouteDescriptor, tail: &str, query: Option<&str>) -> Result<String, GatewayError> {
    let tail = sanitize_tail(tail)?;
    let base = route.backend_url.trim_end_matches('/');
    let mut url = if tail.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{tail}")
    };
    if let Some(query) = query {
        let query = sanitize_query(query)?;
        if !query.is_empty() {
            url = format!("{url}?{query}");
        }
    }
    Ok(url)
}

/// Forward the request to the route's backend, injecting the internal API key
/// and attaching the `PAYMENT-RESPONSE` header on the way back.
pub async fn proxy_request(
    client: &reqwest::Client,
    original_req: &HttpRequest,
    route: &RouteDescriptor,
    tail: &str,
    body: Bytes,
    context: &PaymentContext,
) -> Result<HttpResponse, GatewayError> {
    let url = target_url(route, tail, original_req.uri().query())?;

    let method = match original_req.method().as_str() {
        "GET" => reqwest::Method::GET,
        "POST" => reqwest::Method::POST,
        "PUT" => reqwest::Method::PUT,
        "DELETE" => reqwest::Method::DELETE,
        "PATCH" => reqwest::Method::PATCH,
        "HEAD" => reqwest::Method::HEAD,
        other => {
            return Err(GatewayError::ProxyError(format!(
                "unsupported HTTP method: {other}"
            )))
        }
    };

    let mut builder = client.request(method, &url);
    for (name, value) in original_req.headers() {
        let lowered = name.as_str().to_lowercase();
        if !HEADERS_TO_STRIP.contains(&lowered.as_str()) {
            if let Ok(text) = value.to_str() {
                builder = builder.header(name.as_str(), text);
            }
        }
    }

    // Internal API key for the backend, read at proxy time.
    match std::env::var(&route.backend_api_key_env) {
        Ok(key) if !key.is_empty() => {
            builder = builder.header(route.backend_api_key_header.as_str(), key);
        }
        _ => {
            tracing::warn!(
                route = %route.key,
                var = %route.backend_api_key_env,
                "backend API key not configured, forwarding without it"
            );
        }
    }

    // The payer header passes through verbatim; absent means "unknown".
    let payer_header = original_req
        .headers()
        .get(HEADER_PAYER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown");
    builder = builder.header(HEADER_PAYER, payer_header);

    if !body.is_empty() {
        builder = builder.body(body.to_vec());
    }

    let response = builder.send().await.map_err(|e| {
        tracing::error!(route = %route.key, error = %e, "backend request failed");
        GatewayError::ProxyError("upstream request failed".to_string())
    })?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| {
        tracing::error!(route = %route.key, error = %e, "backend response unreadable");
        GatewayError::ProxyError("failed to read upstream response".to_string())
    })?;

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // A backend 5xx that is not JSON gets wrapped so clients always see a
    // JSON error envelope.
    if status.is_server_error() && !content_type.contains("json") {
        tracing::error!(route = %route.key, status = %status, "backend returned non-JSON 5xx");
        let mut builder = HttpResponse::build(
            actix_web::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY),
        );
        return Ok(cors::apply(&mut builder)
            .insert_header((HEADER_PAYMENT_RESPONSE, context.response_header.clone()))
            .json(serde_json::json!({
                "error": "Upstream error",
                "status": status.as_u16(),
            })));
    }

    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(status.as_u16())
            .unwrap_or(actix_web::http::StatusCode::OK),
    );
    for (name, value) in headers.iter() {
        let lowered = name.as_str().to_lowercase();
        if ALLOWED_RESPONSE_HEADERS.contains(&lowered.as_str()) {
            if let Ok(text) = value.to_str() {
                builder.insert_header((name.as_str(), text));
            }
        }
    }
    cors::apply(&mut builder)
        .insert_header((HEADER_PAYMENT_RESPONSE, context.response_header.clone()));

    Ok(builder.body(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(backend_url: &str) -> RouteDescriptor {
        RouteDescriptor {
            key: "myapi".to_string(),
            path: "/v1/myapi".to_string(),
            backend_name: "myapi".to_string(),
            backend_url: backend_url.to_string(),
            backend_api_key_env: "MYAPI_BACKEND_API_KEY".to_string(),
            backend_api_key_header: "x-api-key".to_string(),
            price: "$0.01".to_string(),
            price_atomic: "10000".to_string(),
            pay_to: None,
            pay_to_sol: None,
            description: "test".to_string(),
            mime_type: "application/json".to_string(),
        }
    }

    #[test]
    fn test_target_url_joins_tail_and_query() {
        let url = target_url(&route("http://api.internal/base/"), "users/42", Some("a=1")).unwrap();
        assert_eq!(url, "http://api.internal/base/users/42?a=1");
    }

    #[test]
    fn test_target_url_without_tail() {
        let url = target_url(&route("http://api.internal/base"), "", None).unwrap();
        assert_eq!(url, "http://api.internal/base");
    }

    #[test]
    fn test_query_rejects_crlf() {
        assert!(target_url(&route("http://x"), "p", Some("a=1\r\nHost: evil")).is_err());
    }

    #[test]
    fn test_tail_rejects_traversal_and_authority() {
        assert!(target_url(&route("http://x"), "../secrets", None).is_err());
        assert!(target_url(&route("http://x"), "/absolute", None).is_err());
        assert!(target_url(&route("http://x"), "user@evil.host", None).is_err());
    }

    #[test]
    fn test_strip_list_blocks_payment_and_credentials() {
        assert!(HEADERS_TO_STRIP.contains(&"payment-signature"));
        assert!(HEADERS_TO_STRIP.contains(&"x-payment"));
        assert!(HEADERS_TO_STRIP.contains(&"authorization"));
        assert!(!HEADERS_TO_STRIP.contains(&"content-type"));
    }
}
