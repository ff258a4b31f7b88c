//! Scoped instrumentation for pipeline code.
//!
//! A [`Tracer`] opens one [`RunScope`] per pipeline execution; the scope
//! opens one [`StepScope`] per stage. Both take the instrumented code as a
//! closure so the trace is finalized on every exit path: a step or run that
//! returns `Err` is stamped, recorded, and the same error is returned to
//! the caller. Failures are captured, never swallowed.
//!
//! A tracer constructed with `enabled = false` selects no-op scopes once at
//! construction; the instrumented closures still run and their results pass
//! through untouched, but nothing is recorded or delivered.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use pipelens_types::{Candidate, Decision, PipelineRun, StepTrace, StepType};

use crate::background::BackgroundSender;
use crate::client::{RunTransport, TraceClient};

/// Metadata key holding the true input-candidate count of a sampled-out step.
pub const META_INPUT_COUNT: &str = "input_count";
/// Metadata key holding the true output-candidate count of a sampled-out step.
pub const META_OUTPUT_COUNT: &str = "output_count";
/// Metadata key the engine sets to the failure message when a step errors.
pub const META_ERROR: &str = "error";

/// Construction-time settings for a [`Tracer`].
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub pipeline_name: String,
    pub pipeline_version: String,
    /// Backend base URL. `None` means local mode: runs are traced but
    /// never delivered.
    pub api_url: Option<String>,
    /// Optional bearer credential added to every delivery request
    pub api_key: Option<String>,
    /// `false` swaps in the no-op implementation of every scope
    pub enabled: bool,
    /// Whether synchronous auto-send failures are swallowed (default) or
    /// surfaced to the pipeline caller
    pub fail_silently: bool,
    /// Send each run when its scope closes
    pub auto_send: bool,
    /// Deliver through the background queue instead of inline
    pub background: bool,
    /// Bounded queue size for background delivery
    pub queue_capacity: usize,
    /// Per-request timeout for the delivery client
    pub timeout_secs: u64,
}

impl TracerConfig {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_version: "1.0.0".to_string(),
            api_url: None,
            api_key: None,
            enabled: true,
            fail_silently: true,
            auto_send: true,
            background: true,
            queue_capacity: 256,
            timeout_secs: 5,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = version.into();
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    pub fn with_auto_send(mut self, auto_send: bool) -> Self {
        self.auto_send = auto_send;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Per-run settings passed to [`Tracer::start_run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use a caller-chosen run id instead of a fresh UUID
    pub run_id: Option<String>,
    pub context: Map<String, Value>,
    pub tags: Vec<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Entry point for instrumenting a pipeline.
///
/// Cheap to share behind an `Arc`; concurrent runs are independent. When
/// background delivery is enabled, construct the tracer inside a tokio
/// runtime and call [`Tracer::close`] at shutdown to drain the queue.
pub struct Tracer {
    pipeline_name: String,
    pipeline_version: String,
    enabled: bool,
    fail_silently: bool,
    auto_send: bool,
    transport: Option<Arc<dyn RunTransport>>,
    queue: Option<BackgroundSender>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        let transport: Option<Arc<dyn RunTransport>> = match (&config.api_url, config.enabled) {
            (Some(url), true) => Some(Arc::new(TraceClient::new(
                url,
                config.api_key.clone(),
                config.timeout_secs,
            ))),
            _ => None,
        };
        Self::build(config, transport)
    }

    /// Build a tracer that delivers through the given transport instead of
    /// an HTTP client.
    pub fn with_transport(config: TracerConfig, transport: Arc<dyn RunTransport>) -> Self {
        let transport = config.enabled.then_some(transport);
        Self::build(config, transport)
    }

    fn build(config: TracerConfig, transport: Option<Arc<dyn RunTransport>>) -> Self {
        let queue = match &transport {
            Some(transport) if config.auto_send && config.background => Some(
                BackgroundSender::spawn(Arc::clone(transport), config.queue_capacity),
            ),
            _ => None,
        };
        Self {
            pipeline_name: config.pipeline_name,
            pipeline_version: config.pipeline_version,
            enabled: config.enabled,
            fail_silently: config.fail_silently,
            auto_send: config.auto_send,
            transport,
            queue,
        }
    }

    /// Trace one pipeline execution.
    ///
    /// The closure's result is returned unchanged. On `Err` the run is
    /// finalized as failed with the error message before the error comes
    /// back. Finished runs (successful or not) are auto-sent unless
    /// configured otherwise; a synchronous delivery failure replaces an
    /// `Ok` result only when `fail_silently` is off, and never masks a
    /// pipeline error.
    pub async fn start_run<T, F, Fut>(&self, opts: RunOptions, f: F) -> Result<T, String>
    where
        F: FnOnce(Arc<RunScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        if !self.enabled {
            return f(Arc::new(RunScope::disabled())).await;
        }

        let mut run = PipelineRun::new(&self.pipeline_name);
        run.pipeline_version = self.pipeline_version.clone();
        if let Some(run_id) = opts.run_id {
            run.run_id = run_id;
        }
        run.context = opts.context;
        run.tags = opts.tags;

        let run_id = run.run_id.clone();
        log::debug!(
            "[TRACER] Starting run {} for pipeline {}",
            run_id,
            self.pipeline_name
        );

        let scope = Arc::new(RunScope::active(run));
        let result = f(Arc::clone(&scope)).await;

        let Some(finished) = scope.finalize(result.as_ref().err().map(|e| e.as_str())) else {
            return result;
        };

        let mut delivery_error = None;
        if self.auto_send {
            if let Some(queue) = &self.queue {
                queue.enqueue(finished);
            } else if let Some(transport) = &self.transport {
                if let Err(e) = transport.deliver(&finished).await {
                    if self.fail_silently {
                        log::warn!("[TRACER] Failed to deliver run {}: {}", run_id, e);
                    } else {
                        delivery_error = Some(e.to_string());
                    }
                }
            }
        }

        match (result, delivery_error) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(e)) => Err(e),
            (Ok(value), None) => Ok(value),
        }
    }

    /// Drain the background queue and stop its worker.
    pub async fn close(mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close().await;
        }
    }
}

/// Handle for one open pipeline run.
pub struct RunScope {
    inner: RunInner,
}

enum RunInner {
    Active(ActiveRun),
    Disabled,
}

struct ActiveRun {
    started: Instant,
    run: Mutex<Option<PipelineRun>>,
}

impl RunScope {
    fn active(run: PipelineRun) -> Self {
        Self {
            inner: RunInner::Active(ActiveRun {
                started: Instant::now(),
                run: Mutex::new(Some(run)),
            }),
        }
    }

    fn disabled() -> Self {
        Self {
            inner: RunInner::Disabled,
        }
    }

    /// The id the finished run will carry. `None` on a disabled tracer.
    pub fn run_id(&self) -> Option<String> {
        match &self.inner {
            RunInner::Active(active) => active.run.lock().as_ref().map(|r| r.run_id.clone()),
            RunInner::Disabled => None,
        }
    }

    pub fn set_final_output(&self, value: Value) {
        self.with_run(|run| run.final_output = Some(value));
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        let tag = tag.into();
        self.with_run(|run| run.tags.push(tag));
    }

    pub fn set_context_value(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.with_run(|run| {
            run.context.insert(key, value);
        });
    }

    /// Run `f` inside a recorded step.
    ///
    /// The step is stamped and appended on every exit: on `Err` the message
    /// lands under the `error` metadata key and the same error is returned.
    pub async fn step<T, F, Fut>(
        &self,
        name: &str,
        step_type: impl Into<String>,
        f: F,
    ) -> Result<T, String>
    where
        F: FnOnce(Arc<StepScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.step_sampled(name, step_type, 1.0, f).await
    }

    /// Like [`RunScope::step`] with candidate sampling.
    ///
    /// One Bernoulli trial at step creation decides whether both candidate
    /// lists of this step are kept. A sampled-out step keeps everything
    /// else (inputs, outputs, decisions, metadata) plus the true list
    /// lengths under the `input_count` / `output_count` metadata keys.
    pub async fn step_sampled<T, F, Fut>(
        &self,
        name: &str,
        step_type: impl Into<String>,
        sample_rate: f64,
        f: F,
    ) -> Result<T, String>
    where
        F: FnOnce(Arc<StepScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let active = match &self.inner {
            RunInner::Active(active) => active,
            RunInner::Disabled => return f(Arc::new(StepScope::disabled())).await,
        };

        let sampled = rand::random::<f64>() < sample_rate;
        let mut step = StepTrace::new(name, step_type);
        step.sample_rate = sample_rate;

        let scope = Arc::new(StepScope::active(step, sampled));
        let started = Instant::now();
        let result = f(Arc::clone(&scope)).await;

        if let Some(mut step) = scope.take() {
            if let Err(e) = &result {
                step.metadata
                    .insert(META_ERROR.to_string(), Value::String(e.clone()));
            }
            step.duration_ms = Some(elapsed_ms(started));
            if let Some(run) = active.run.lock().as_mut() {
                run.steps.push(step);
            }
        }
        result
    }

    pub async fn filter_step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, String>
    where
        F: FnOnce(Arc<StepScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.step_sampled(name, StepType::Filter, 1.0, f).await
    }

    pub async fn rank_step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, String>
    where
        F: FnOnce(Arc<StepScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.step_sampled(name, StepType::Rank, 1.0, f).await
    }

    pub async fn llm_step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, String>
    where
        F: FnOnce(Arc<StepScope>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.step_sampled(name, StepType::LlmCall, 1.0, f).await
    }

    fn with_run(&self, f: impl FnOnce(&mut PipelineRun)) {
        if let RunInner::Active(active) = &self.inner {
            if let Some(run) = active.run.lock().as_mut() {
                f(run);
            }
        }
    }

    /// Take the run out for delivery, stamping completion and outcome.
    /// Later scope calls become no-ops.
    fn finalize(&self, error: Option<&str>) -> Option<PipelineRun> {
        match &self.inner {
            RunInner::Active(active) => active.run.lock().take().map(|mut run| {
                run.completed_at = Some(Utc::now());
                run.total_duration_ms = Some(elapsed_ms(active.started));
                if let Some(message) = error {
                    run.success = false;
                    run.error = Some(message.to_string());
                }
                run
            }),
            RunInner::Disabled => None,
        }
    }
}

/// Handle for one open step. All operations are valid only while the step
/// is open; after the step closes they do nothing.
pub struct StepScope {
    inner: StepInner,
}

enum StepInner {
    Active(ActiveStep),
    Disabled,
}

struct ActiveStep {
    sampled: bool,
    step: Mutex<Option<StepTrace>>,
}

impl StepScope {
    fn active(step: StepTrace, sampled: bool) -> Self {
        Self {
            inner: StepInner::Active(ActiveStep {
                sampled,
                step: Mutex::new(Some(step)),
            }),
        }
    }

    fn disabled() -> Self {
        Self {
            inner: StepInner::Disabled,
        }
    }

    /// Record one keyed input (a parameter, threshold, query string).
    pub fn set_input(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.with_step(|step, _| {
            step.inputs.insert(key, value);
        });
    }

    /// Merge a map of keyed inputs.
    pub fn set_inputs(&self, inputs: Map<String, Value>) {
        self.with_step(|step, _| step.inputs.extend(inputs));
    }

    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.with_step(|step, _| {
            step.outputs.insert(key, value);
        });
    }

    pub fn set_outputs(&self, outputs: Map<String, Value>) {
        self.with_step(|step, _| step.outputs.extend(outputs));
    }

    /// Record the candidates this step received. A step that lost its
    /// sampling trial discards the list and keeps only its length under
    /// the `input_count` metadata key.
    pub fn set_input_candidates(&self, candidates: Vec<Candidate>) {
        self.with_step(|step, sampled| {
            if sampled {
                step.input_candidates = candidates;
            } else {
                step.metadata
                    .insert(META_INPUT_COUNT.to_string(), Value::from(candidates.len()));
            }
        });
    }

    /// Record the candidates this step produced; sampling as above, with
    /// the length under `output_count`.
    pub fn set_output_candidates(&self, candidates: Vec<Candidate>) {
        self.with_step(|step, sampled| {
            if sampled {
                step.output_candidates = candidates;
            } else {
                step.metadata
                    .insert(META_OUTPUT_COUNT.to_string(), Value::from(candidates.len()));
            }
        });
    }

    /// Append one input candidate, honoring the step's sampling trial.
    pub fn add_input_candidate(&self, candidate: Candidate) {
        self.with_step(|step, sampled| {
            if sampled {
                step.input_candidates.push(candidate);
            } else {
                bump_count(&mut step.metadata, META_INPUT_COUNT);
            }
        });
    }

    /// Append one output candidate, honoring the step's sampling trial.
    pub fn add_output_candidate(&self, candidate: Candidate) {
        self.with_step(|step, sampled| {
            if sampled {
                step.output_candidates.push(candidate);
            } else {
                bump_count(&mut step.metadata, META_OUTPUT_COUNT);
            }
        });
    }

    /// Decisions are exempt from sampling and always recorded.
    pub fn add_decision(&self, decision: Decision) {
        self.with_step(|step, _| step.decisions.push(decision));
    }

    /// Build and append a decision from its parts.
    pub fn add_decision_parts(
        &self,
        action: impl Into<String>,
        reason: impl Into<String>,
        criteria: Map<String, Value>,
    ) {
        self.add_decision(Decision {
            action: action.into(),
            reason: reason.into(),
            criteria,
        });
    }

    pub fn add_metadata(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.with_step(|step, _| {
            step.metadata.insert(key, value);
        });
    }

    fn with_step(&self, f: impl FnOnce(&mut StepTrace, bool)) {
        if let StepInner::Active(active) = &self.inner {
            if let Some(step) = active.step.lock().as_mut() {
                f(step, active.sampled);
            }
        }
    }

    fn take(&self) -> Option<StepTrace> {
        match &self.inner {
            StepInner::Active(active) => active.step.lock().take(),
            StepInner::Disabled => None,
        }
    }
}

fn bump_count(metadata: &mut Map<String, Value>, key: &str) {
    let next = metadata.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
    metadata.insert(key.to_string(), Value::from(next));
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryTransport, SendError};
    use async_trait::async_trait;
    use pipelens_types::CreateRunResponse;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn capture_tracer(name: &str) -> (Tracer, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::with_transport(
            TracerConfig::new(name).with_background(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );
        (tracer, transport)
    }

    struct RefusingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunTransport for RefusingTransport {
        async fn deliver(&self, _run: &PipelineRun) -> Result<CreateRunResponse, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SendError::Transport("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn records_steps_in_creation_order_with_durations() {
        let (tracer, transport) = capture_tracer("selection");

        let picked = tracer
            .start_run(RunOptions::new().with_tag("nightly"), |run| async move {
                run.step("search", StepType::Search, |step| async move {
                    step.set_input("query", json!("widgets"));
                    step.set_output_candidates(vec![Candidate::new("a"), Candidate::new("b")]);
                    Ok(2usize)
                })
                .await?;
                run.filter_step("price_filter", |step| async move {
                    step.set_input_candidates(vec![Candidate::new("a"), Candidate::new("b")]);
                    step.add_decision_parts(
                        "dropped",
                        "over budget",
                        Map::from_iter([("max_price".to_string(), json!(100))]),
                    );
                    step.set_output_candidates(vec![Candidate::new("a")]);
                    Ok(1usize)
                })
                .await?;
                run.set_final_output(json!({"winner": "a"}));
                Ok("a".to_string())
            })
            .await
            .unwrap();

        assert_eq!(picked, "a");
        let runs = transport.delivered();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.pipeline_name, "selection");
        assert!(run.success);
        assert!(run.error.is_none());
        assert!(run.completed_at.is_some());
        assert!(run.total_duration_ms.is_some());
        assert_eq!(run.tags, vec!["nightly".to_string()]);
        assert_eq!(run.final_output, Some(json!({"winner": "a"})));

        let names: Vec<&str> = run.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["search", "price_filter"]);
        assert!(run.steps.iter().all(|s| s.duration_ms.is_some()));
        assert_eq!(run.steps[1].step_type, "filter");
        assert_eq!(run.steps[1].decisions.len(), 1);
        assert_eq!(run.steps[1].decisions[0].action, "dropped");
        assert_eq!(run.steps[1].decisions[0].criteria["max_price"], json!(100));
        assert_eq!(run.steps[1].input_candidates.len(), 2);
        assert_eq!(run.steps[1].output_candidates.len(), 1);
    }

    #[tokio::test]
    async fn step_failure_is_captured_and_re_raised() {
        let (tracer, transport) = capture_tracer("failing");

        let result: Result<(), String> = tracer
            .start_run(RunOptions::new(), |run| async move {
                run.step("explode", "custom", |step| async move {
                    step.set_input("n", json!(1));
                    Err::<(), String>("Test error".to_string())
                })
                .await?;
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err(), "Test error");

        // The failed run is still delivered; that is the point of tracing.
        let runs = transport.delivered();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("Test error"));
        assert_eq!(run.steps.len(), 1);
        assert_eq!(
            run.steps[0].metadata.get(META_ERROR),
            Some(&json!("Test error"))
        );
        assert!(run.steps[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn zero_sample_rate_drops_candidates_but_keeps_counts() {
        let (tracer, transport) = capture_tracer("sampled");

        tracer
            .start_run(RunOptions::new(), |run| async move {
                for i in 0..1000 {
                    run.step_sampled(&format!("step_{i}"), "filter", 0.0, |step| async move {
                        step.set_input_candidates(vec![
                            Candidate::new("a"),
                            Candidate::new("b"),
                            Candidate::new("c"),
                        ]);
                        step.add_decision(Decision::new("kept", "all pass"));
                        step.set_output_candidates(vec![Candidate::new("a")]);
                        Ok(())
                    })
                    .await?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let runs = transport.delivered();
        let run = &runs[0];
        assert_eq!(run.steps.len(), 1000);
        for step in &run.steps {
            assert!(step.input_candidates.is_empty());
            assert!(step.output_candidates.is_empty());
            assert_eq!(step.metadata.get(META_INPUT_COUNT), Some(&json!(3)));
            assert_eq!(step.metadata.get(META_OUTPUT_COUNT), Some(&json!(1)));
            assert_eq!(step.decisions.len(), 1);
            assert_eq!(step.sample_rate, 0.0);
        }
    }

    #[tokio::test]
    async fn full_sample_rate_keeps_all_candidates() {
        let (tracer, transport) = capture_tracer("sampled_full");

        tracer
            .start_run(RunOptions::new(), |run| async move {
                run.step_sampled("keep", "filter", 1.0, |step| async move {
                    step.set_input_candidates(vec![Candidate::new("a"), Candidate::new("b")]);
                    step.add_input_candidate(Candidate::new("c"));
                    step.set_output_candidates(vec![Candidate::new("a")]);
                    Ok(())
                })
                .await
            })
            .await
            .unwrap();

        let runs = transport.delivered();
        let step = &runs[0].steps[0];
        assert_eq!(step.input_candidates.len(), 3);
        assert_eq!(step.output_candidates.len(), 1);
        assert!(step.metadata.get(META_INPUT_COUNT).is_none());
        assert!(step.metadata.get(META_OUTPUT_COUNT).is_none());
    }

    #[tokio::test]
    async fn disabled_tracer_runs_pipeline_without_recording_or_sending() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::with_transport(
            TracerConfig::new("disabled")
                .with_enabled(false)
                .with_background(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        // Vary the shape of each sequence; results must always pass through.
        for round in 0..100usize {
            let value = tracer
                .start_run(RunOptions::new(), |run| async move {
                    assert!(run.run_id().is_none());
                    run.add_tag("ignored");
                    let mut total = 0usize;
                    for i in 0..(round % 7) {
                        total += run
                            .step(&format!("s{i}"), "transform", |step| async move {
                                step.set_input("i", json!(i));
                                step.add_decision(Decision::new("noop", "checking"));
                                step.set_input_candidates(vec![Candidate::new("x")]);
                                Ok(1usize)
                            })
                            .await?;
                    }
                    Ok::<usize, String>(total)
                })
                .await
                .unwrap();
            assert_eq!(value, round % 7);
        }

        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn sync_delivery_failure_surfaces_when_not_silent() {
        let transport = Arc::new(RefusingTransport {
            calls: AtomicUsize::new(0),
        });
        let tracer = Tracer::with_transport(
            TracerConfig::new("strict")
                .with_background(false)
                .with_fail_silently(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        let result = tracer
            .start_run(RunOptions::new(), |_run| async move { Ok(42) })
            .await;

        let err = result.unwrap_err();
        assert!(err.contains("connection refused"), "err was: {}", err);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_delivery_failure_is_swallowed_by_default() {
        let transport = Arc::new(RefusingTransport {
            calls: AtomicUsize::new(0),
        });
        let tracer = Tracer::with_transport(
            TracerConfig::new("quiet").with_background(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        let value = tracer
            .start_run(RunOptions::new(), |_run| async move { Ok(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pipeline_error_takes_precedence_over_delivery_error() {
        let transport = Arc::new(RefusingTransport {
            calls: AtomicUsize::new(0),
        });
        let tracer = Tracer::with_transport(
            TracerConfig::new("strict")
                .with_background(false)
                .with_fail_silently(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        let result: Result<(), String> = tracer
            .start_run(RunOptions::new(), |_run| async move {
                Err("boom".to_string())
            })
            .await;

        assert_eq!(result.unwrap_err(), "boom");
        // Delivery was still attempted for the failed run.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_auto_send_delivers_after_close() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::with_transport(
            TracerConfig::new("bg"),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        tracer
            .start_run(RunOptions::new(), |_run| async move { Ok(()) })
            .await
            .unwrap();
        tracer.close().await;

        assert_eq!(transport.len(), 1);
        assert_eq!(transport.delivered()[0].pipeline_name, "bg");
    }

    #[tokio::test]
    async fn auto_send_disabled_never_delivers() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::with_transport(
            TracerConfig::new("manual")
                .with_auto_send(false)
                .with_background(false),
            Arc::clone(&transport) as Arc<dyn RunTransport>,
        );

        tracer
            .start_run(RunOptions::new(), |run| async move {
                run.step("s", "custom", |_step| async move { Ok(()) }).await
            })
            .await
            .unwrap();

        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn run_options_set_id_context_and_tags() {
        let (tracer, transport) = capture_tracer("opts");

        let opts = RunOptions::new()
            .with_run_id("fixed-id")
            .with_context_value("user_id", json!("u42"))
            .with_tag("experiment");
        tracer
            .start_run(opts, |run| async move {
                assert_eq!(run.run_id().as_deref(), Some("fixed-id"));
                run.set_context_value("region", json!("eu"));
                Ok(())
            })
            .await
            .unwrap();

        let run = &transport.delivered()[0];
        assert_eq!(run.run_id, "fixed-id");
        assert_eq!(run.context.get("user_id"), Some(&json!("u42")));
        assert_eq!(run.context.get("region"), Some(&json!("eu")));
        assert_eq!(run.tags, vec!["experiment".to_string()]);
    }

    #[tokio::test]
    async fn local_mode_without_api_url_traces_but_never_sends() {
        let tracer = Tracer::new(TracerConfig::new("local"));

        let value = tracer
            .start_run(RunOptions::new(), |run| async move {
                run.step("only", "transform", |step| async move {
                    step.set_output("n", json!(7));
                    Ok(7)
                })
                .await
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
    }
}
