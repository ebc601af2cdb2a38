//! Wildcard CORS headers, pinned by the payment protocol.
//!
//! Every gateway response carries these, including the 204 preflight; the
//! payment headers are exposed so browser clients can read them.

use actix_web::{HttpResponse, HttpResponseBuilder};

pub const ALLOW_ORIGIN: (&str, &str) = ("Access-Control-Allow-Origin", "*");
pub const ALLOW_METHODS: (&str, &str) = (
    "Access-Control-Allow-Methods",
    "GET, POST, PUT, PATCH, DELETE, OPTIONS",
);
pub const ALLOW_HEADERS: (&str, &str) = (
    "Access-Control-Allow-Headers",
    "Content-Type, Payment-Signature, X-Payment, X-X402-Payer",
);
pub const EXPOSE_HEADERS: (&str, &str) = (
    "Access-Control-Expose-Headers",
    "PAYMENT-REQUIRED, PAYMENT-RESPONSE",
);

/// Attach the CORS header set to a response under construction.
pub fn apply(builder: &mut HttpResponseBuilder) -> &mut HttpResponseBuilder {
    builder
        .insert_header(ALLOW_ORIGIN)
        .insert_header(ALLOW_METHODS)
        .insert_header(ALLOW_HEADERS)
        .insert_header(EXPOSE_HEADERS)
}

/// The OPTIONS preflight answer.
pub fn preflight() -> HttpResponse {
    apply(&mut HttpResponse::NoContent()).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_is_204_with_wildcard() {
        let resp = preflight();
        assert_eq!(resp.status(), actix_web::http::StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()
                .get("Access-Control-Allow-Origin")
                .unwrap()
                .to_str()
                .unwrap(),
            "*"
        );
        assert!(resp
            .headers()
            .get("Access-Control-Allow-Headers")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Payment-Signature"));
    }
}
