use actix_web::{web, HttpResponse};

use crate::cors;

/// GET /health - liveness probe
pub async fn health() -> HttpResponse {
    cors::apply(&mut HttpResponse::Ok()).json(serde_json::json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)));
}
