//! Cross-run step listing.

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::db::tables::steps::StepFilter;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/steps").route(web::get().to(list_steps)));
}

#[derive(Debug, Deserialize)]
struct StepListQuery {
    step_name: Option<String>,
    step_type: Option<String>,
    pipeline_name: Option<String>,
    min_reduction_rate: Option<f64>,
    max_reduction_rate: Option<f64>,
    min_duration_ms: Option<f64>,
    max_duration_ms: Option<f64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_steps(
    state: web::Data<AppState>,
    query: web::Query<StepListQuery>,
) -> impl Responder {
    for (name, value) in [
        ("min_reduction_rate", query.min_reduction_rate),
        ("max_reduction_rate", query.max_reduction_rate),
    ] {
        if let Some(rate) = value {
            if !(0.0..=1.0).contains(&rate) {
                return HttpResponse::BadRequest().json(ErrorResponse {
                    error: format!("{} must be between 0.0 and 1.0", name),
                });
            }
        }
    }

    let filter = StepFilter {
        step_name: query.step_name.clone(),
        step_type: query.step_type.clone(),
        pipeline_name: query.pipeline_name.clone(),
        min_reduction_rate: query.min_reduction_rate,
        max_reduction_rate: query.max_reduction_rate,
        min_duration_ms: query.min_duration_ms,
        max_duration_ms: query.max_duration_ms,
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
        offset: query.offset.unwrap_or(0).max(0),
    };

    match state.db.query_steps(&filter) {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => {
            log::error!("[QUERY] Step listing failed: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: format!("Failed to list steps: {}", e),
            })
        }
    }
}
