use crate::broker::Broker;
use crate::models::{DialectId, GameMode};
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FormatQuery {
    format: Option<String>,
}

/// `GET /pixsim-api/status`
pub async fn status(broker: web::Data<Broker>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "active": broker.is_active(),
        "starting": broker.is_starting(),
        "crashed": broker.is_crashed(),
        "time": chrono::Utc::now().timestamp_millis(),
    }))
}

/// `GET /pixsim-api/maps/list/{gameMode}`
pub async fn map_list(broker: web::Data<Broker>, path: web::Path<String>) -> impl Responder {
    let Some(mode) = GameMode::from_tag(&path) else {
        return HttpResponse::NotFound().finish();
    };
    let ids = broker.catalog.list(mode);
    if ids.is_empty() {
        return HttpResponse::NotFound().finish();
    }
    HttpResponse::Ok().json(ids)
}

/// `GET /pixsim-api/maps/{gameMode}/{id}?format=<dialect>`
pub async fn map_get(
    broker: web::Data<Broker>,
    path: web::Path<(String, String)>,
    query: web::Query<FormatQuery>,
) -> impl Responder {
    let (mode_tag, id) = path.into_inner();
    let Some(format) = query.format.as_deref().and_then(DialectId::from_tag) else {
        return HttpResponse::BadRequest().finish();
    };
    let Some(mode) = GameMode::from_tag(&mode_tag) else {
        return HttpResponse::NotFound().finish();
    };
    match broker.catalog.get(mode, &id, format) {
        Some(record) => HttpResponse::Ok().json(record),
        None => HttpResponse::NotFound().finish(),
    }
}

/// `GET /pixsim-api/controllers/{path}?format=<dialect>`
pub async fn controller_get(
    broker: web::Data<Broker>,
    path: web::Path<String>,
    query: web::Query<FormatQuery>,
) -> impl Responder {
    let Some(format) = query.format.as_deref().and_then(DialectId::from_tag) else {
        return HttpResponse::BadRequest().finish();
    };
    match broker.controllers.get(&path, format) {
        Some(text) => HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(text.to_string()),
        None => HttpResponse::NotFound().finish(),
    }
}
