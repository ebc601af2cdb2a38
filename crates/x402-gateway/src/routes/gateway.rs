//! The paid surface: ANY `/v1/{route}` and `/v1/{route}/{tail}`.

use actix_web::{http::Method, web, HttpRequest, HttpResponse};

use crate::cors;
use crate::error::GatewayError;
use crate::middleware::{settle_request, PaymentGate};
use crate::proxy::proxy_request;
use crate::state::AppState;

async fn handle(
    req: HttpRequest,
    route_key: String,
    tail: String,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    if req.method() == Method::OPTIONS {
        return Ok(cors::preflight());
    }

    let Some(route) = state.routes.resolve(&route_key) else {
        return Err(GatewayError::UnknownRoute(route_key));
    };

    match settle_request(&req, route, &state).await {
        PaymentGate::Respond(response) => Ok(response),
        PaymentGate::Proceed(context) => {
            proxy_request(&state.http_client, &req, route, &tail, body, &context).await
        }
    }
}

/// ANY /v1/{route}/{tail:.*}
async fn gateway_entry(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let (route_key, tail) = path.into_inner();
    handle(req, route_key, tail, body, state).await
}

/// ANY /v1/{route}
async fn gateway_entry_no_tail(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let route_key = path.into_inner();
    handle(req, route_key, String::new(), body, state).await
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/{route}").route(web::route().to(gateway_entry_no_tail)))
        .service(web::resource("/v1/{route}/{tail:.*}").route(web::route().to(gateway_entry)));
}
