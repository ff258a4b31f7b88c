//! Shared trace model for the pipelens SDK and backend.
//!
//! A `PipelineRun` is one traced execution of a multi-step pipeline. Each
//! `StepTrace` records what a stage saw (`input_candidates`), what it kept
//! (`output_candidates`), and why (`decisions`), so a failed or surprising
//! run can be reconstructed after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =====================================================
// Trace Model
// =====================================================

/// An item flowing through a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Candidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Map::new(),
            score: None,
            metadata: Map::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// A recorded judgment about candidates or a stage outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// What happened, e.g. "kept", "dropped", "selected"
    pub action: String,
    /// Why it happened
    pub reason: String,
    /// The thresholds or rules that were applied
    #[serde(default)]
    pub criteria: Map<String, Value>,
}

impl Decision {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            criteria: Map::new(),
        }
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: Value) -> Self {
        self.criteria.insert(key.into(), value);
        self
    }
}

/// Conventional step classifications. `step_type` stays a free-form string
/// on the wire; these are the well-known values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    Search,
    Filter,
    Transform,
    Rank,
    Select,
    LlmCall,
    ApiCall,
    Custom,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Search => "search",
            StepType::Filter => "filter",
            StepType::Transform => "transform",
            StepType::Rank => "rank",
            StepType::Select => "select",
            StepType::LlmCall => "llm_call",
            StepType::ApiCall => "api_call",
            StepType::Custom => "custom",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StepType> for String {
    fn from(step_type: StepType) -> Self {
        step_type.as_str().to_string()
    }
}

/// One instrumented stage of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_name: String,
    pub step_type: String,
    /// Keyed inputs beyond the candidate list (parameters, thresholds)
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Keyed outputs beyond the candidate list
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub input_candidates: Vec<Candidate>,
    #[serde(default)]
    pub output_candidates: Vec<Candidate>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// The sampling probability this step was recorded under
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl StepTrace {
    pub fn new(step_name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            step_type: step_type.into(),
            inputs: Map::new(),
            outputs: Map::new(),
            input_candidates: Vec::new(),
            output_candidates: Vec::new(),
            decisions: Vec::new(),
            duration_ms: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
            sample_rate: 1.0,
        }
    }

    /// Compact view of this step for logs and quick inspection.
    pub fn summary(&self) -> StepSummary {
        StepSummary {
            step_name: self.step_name.clone(),
            step_type: self.step_type.clone(),
            input_count: self.input_candidates.len(),
            output_count: self.output_candidates.len(),
            duration_ms: self.duration_ms,
            decision_count: self.decisions.len(),
        }
    }
}

/// Compact per-step view produced by [`StepTrace::summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_name: String,
    pub step_type: String,
    pub input_count: usize,
    pub output_count: usize,
    pub duration_ms: Option<f64>,
    pub decision_count: usize,
}

/// A complete traced pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_name: String,
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    /// Ambient facts about the run (user id, environment, experiment arm)
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: Option<f64>,
    /// Steps in creation order
    #[serde(default)]
    pub steps: Vec<StepTrace>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub final_output: Option<Value>,
}

fn default_pipeline_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl PipelineRun {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            pipeline_name: pipeline_name.into(),
            pipeline_version: default_pipeline_version(),
            context: Map::new(),
            tags: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            total_duration_ms: None,
            steps: Vec::new(),
            success: true,
            error: None,
            final_output: None,
        }
    }
}

// =====================================================
// Wire Types (API responses)
// =====================================================

/// Body of a successful `POST /api/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub status: String,
    pub run_id: String,
}

/// Lightweight run view for list endpoints.
///
/// Timestamps come back as the stored RFC 3339 text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline_name: String,
    pub pipeline_version: String,
    pub success: bool,
    pub total_duration_ms: Option<f64>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub step_count: i64,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    pub total: i64,
    pub items: Vec<RunSummary>,
}

/// A persisted step as returned by the API, including the fields the
/// backend derives at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_name: String,
    pub step_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub input_candidates: Vec<Candidate>,
    #[serde(default)]
    pub output_candidates: Vec<Candidate>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    pub duration_ms: Option<f64>,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub sample_rate: f64,
    pub input_count: i64,
    pub output_count: i64,
    pub reduction_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepListResponse {
    pub total: i64,
    pub items: Vec<StepRecord>,
}

/// Full run detail returned by `GET /api/runs/{run_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run_id: String,
    pub pipeline_name: String,
    pub pipeline_version: String,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub total_duration_ms: Option<f64>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub final_output: Option<Value>,
    pub created_at: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

/// One `(step_type, step_name)` group from the step-performance endpoint.
/// Aggregates default to 0 when a group has no data for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPerformanceRow {
    pub step_type: String,
    pub step_name: String,
    pub count: i64,
    pub avg_reduction_rate: f64,
    pub avg_duration_ms: f64,
    pub max_reduction_rate: f64,
    pub min_reduction_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPerformanceResponse {
    pub analytics: Vec<StepPerformanceRow>,
}
