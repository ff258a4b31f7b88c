//! Aggregated step-performance reporting.

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};

use crate::AppState;
use pipelens_types::StepPerformanceResponse;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/analytics").route("/step-performance", web::get().to(step_performance)),
    );
}

#[derive(Debug, Deserialize)]
struct StepPerformanceQuery {
    pipeline_name: Option<String>,
    step_type: Option<String>,
}

async fn step_performance(
    state: web::Data<AppState>,
    query: web::Query<StepPerformanceQuery>,
) -> impl Responder {
    match state
        .db
        .step_performance(query.pipeline_name.as_deref(), query.step_type.as_deref())
    {
        Ok(rows) => HttpResponse::Ok().json(StepPerformanceResponse { analytics: rows }),
        Err(e) => {
            log::error!("[QUERY] Step performance aggregation failed: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: format!("Failed to compute step performance: {}", e),
            })
        }
    }
}
