//! Client-side tracing for multi-step selection pipelines.
//!
//! Wraps each pipeline run and step in a scope that records candidates,
//! decisions, timings, and failures, then ships the finished run to the
//! collector backend over HTTP, either inline or through a bounded
//! background queue.
//!
//! ```no_run
//! use pipelens_sdk::{Candidate, Decision, RunOptions, Tracer, TracerConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<String, String> {
//! let tracer = Tracer::new(
//!     TracerConfig::new("product-search")
//!         .with_api_url("http://localhost:8000")
//!         .with_background(false),
//! );
//!
//! let winner = tracer
//!     .start_run(RunOptions::new().with_tag("demo"), |run| async move {
//!         let kept = run
//!             .filter_step("price_filter", |step| async move {
//!                 step.set_input_candidates(vec![Candidate::new("a"), Candidate::new("b")]);
//!                 step.add_decision(Decision::new("dropped b", "over budget"));
//!                 step.set_output_candidates(vec![Candidate::new("a")]);
//!                 Ok(vec!["a".to_string()])
//!             })
//!             .await?;
//!         run.set_final_output(json!({ "kept": kept }));
//!         Ok(kept[0].clone())
//!     })
//!     .await?;
//! # Ok(winner)
//! # }
//! ```

pub mod background;
pub mod client;
pub mod tracer;

pub use background::BackgroundSender;
pub use client::{MemoryTransport, RunQuery, RunTransport, SendError, TraceClient};
pub use tracer::{
    META_ERROR, META_INPUT_COUNT, META_OUTPUT_COUNT, RunOptions, RunScope, StepScope, Tracer,
    TracerConfig,
};

pub use pipelens_types::{
    Candidate, CreateRunResponse, Decision, PipelineRun, RunDetail, RunListResponse, StepTrace,
    StepType,
};
