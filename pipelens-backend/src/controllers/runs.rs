//! Run ingestion and query endpoints.

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::db::tables::runs::{IngestOutcome, RunFilter};
use pipelens_types::{CreateRunResponse, PipelineRun};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/runs")
            .route("", web::post().to(create_run))
            .route("", web::get().to(list_runs))
            .route("/{run_id}", web::get().to(get_run)),
    );
}

async fn create_run(state: web::Data<AppState>, body: web::Json<PipelineRun>) -> impl Responder {
    let run = body.into_inner();
    match state.db.ingest_run(&run) {
        Ok(IngestOutcome::Created) => {
            log::info!("[INGEST] Stored run {} ({} steps)", run.run_id, run.steps.len());
            HttpResponse::Created().json(CreateRunResponse {
                status: "created".to_string(),
                run_id: run.run_id,
            })
        }
        Ok(IngestOutcome::Duplicate) => HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Run {} already exists", run.run_id),
        }),
        Err(e) => {
            log::error!("[INGEST] Failed to store run {}: {}", run.run_id, e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: format!("Failed to store run: {}", e),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunListQuery {
    pipeline_name: Option<String>,
    pipeline_version: Option<String>,
    success: Option<bool>,
    /// Single tag the run must carry
    tags: Option<String>,
    /// JSON object; every key/value pair must match the stored context
    context: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_runs(state: web::Data<AppState>, query: web::Query<RunListQuery>) -> impl Responder {
    let context = match query.context.as_deref() {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                return HttpResponse::BadRequest().json(ErrorResponse {
                    error: "Invalid JSON format for context parameter".to_string(),
                });
            }
        },
        None => None,
    };

    let filter = RunFilter {
        pipeline_name: query.pipeline_name.clone(),
        pipeline_version: query.pipeline_version.clone(),
        success: query.success,
        tag: query.tags.clone(),
        context,
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
        offset: query.offset.unwrap_or(0).max(0),
    };

    match state.db.list_runs(&filter) {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => {
            log::error!("[QUERY] Run listing failed: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: format!("Failed to list runs: {}", e),
            })
        }
    }
}

async fn get_run(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let run_id = path.into_inner();
    match state.db.get_run(&run_id) {
        Ok(Some(detail)) => HttpResponse::Ok().json(detail),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: "Run not found".to_string(),
        }),
        Err(e) => {
            log::error!("[QUERY] Run lookup failed for {}: {}", run_id, e);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: format!("Failed to fetch run: {}", e),
            })
        }
    }
}
