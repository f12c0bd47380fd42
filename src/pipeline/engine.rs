//! Dependency-ordered, concurrent execution of compiled pipelines.
//!
//! The coordinator owns the bindings map and the readiness bookkeeping; each step runs in
//! its own task against a frozen snapshot of the bindings it was dispatched with. Ready
//! steps are throttled by a per-run semaphore (the pipeline's `max_concurrency`) and then
//! by the engine-wide one, so a busy pipeline cannot starve the rest of the gateway.

use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use serde_json::{Map, Value as JsonValue};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{FailurePolicy, GatewaySettings},
    connector::StepContext,
    core::{
        Connector, ConnectorError, ErrorOrigin, ExpressionEvaluator, GatewayError,
        GatewayResult, ParsedConfig,
    },
    internal_error,
    metrics::{PIPELINE_LATENCY, STEP_FAILURES},
};

use super::graph::{CompiledPipeline, CompiledStep};

/// Request-scoped inputs of one pipeline run.
#[derive(Clone)]
pub struct RunContext {
    pub request_id: String,
    pub client_id: Option<String>,
    /// Cancelled when the request is abandoned
    pub cancel: CancellationToken,
    /// Request-level deadline, if any
    pub deadline: Option<Instant>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            client_id: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }
}

pub struct PipelineEngine {
    global: Arc<Semaphore>,
    default_step_timeout: Duration,
    max_step_timeout: Duration,
    default_pipeline_timeout: Duration,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

type StepOutcome = (usize, GatewayResult<JsonValue>);

impl PipelineEngine {
    pub fn new(settings: &GatewaySettings, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(settings.max_inflight_steps.max(1))),
            default_step_timeout: Duration::from_millis(settings.default_step_timeout_ms),
            max_step_timeout: Duration::from_millis(settings.max_step_timeout_ms),
            default_pipeline_timeout: Duration::from_millis(settings.request_timeout_ms),
            evaluator,
        }
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    fn step_timeout(&self, step: &CompiledStep) -> Duration {
        step.timeout
            .unwrap_or(self.default_step_timeout)
            .min(self.max_step_timeout)
    }

    /// Run `pipeline` to completion and return its output bindings.
    pub async fn run(
        &self,
        pipeline: &CompiledPipeline,
        initial: Map<String, JsonValue>,
        ctx: RunContext,
    ) -> GatewayResult<Map<String, JsonValue>> {
        let started = Instant::now();
        let result = self.execute(pipeline, initial, ctx, started).await;
        PIPELINE_LATENCY
            .with_label_values(&[pipeline.id.as_str()])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn execute(
        &self,
        pipeline: &CompiledPipeline,
        initial: Map<String, JsonValue>,
        ctx: RunContext,
        started: Instant,
    ) -> GatewayResult<Map<String, JsonValue>> {
        let budget = started + pipeline.timeout.unwrap_or(self.default_pipeline_timeout);
        let deadline = ctx.deadline.map_or(budget, |d| d.min(budget));
        let cancel = ctx.cancel.child_token();
        // cancels every step of this run when the coordinator returns, whatever the outcome
        let _guard = cancel.clone().drop_guard();

        let mut run = Run {
            engine: self,
            pipeline,
            ctx: &ctx,
            cancel: &cancel,
            deadline,
            local: Arc::new(Semaphore::new(pipeline.max_concurrency)),
            bindings: initial,
            waiting: pipeline.steps.iter().map(|s| s.deps.len()).collect(),
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            finished: 0,
        };
        run.ready
            .extend((0..pipeline.steps.len()).filter(|&i| run.waiting[i] == 0));

        let outcome = run.drive().await;
        if outcome.is_err() {
            cancel.cancel();
            run.tasks.shutdown().await;
        }
        outcome?;

        Ok(collect_output(pipeline, run.bindings))
    }
}

struct Run<'a> {
    engine: &'a PipelineEngine,
    pipeline: &'a CompiledPipeline,
    ctx: &'a RunContext,
    cancel: &'a CancellationToken,
    deadline: Instant,
    local: Arc<Semaphore>,
    bindings: Map<String, JsonValue>,
    waiting: Vec<usize>,
    ready: VecDeque<usize>,
    tasks: JoinSet<StepOutcome>,
    finished: usize,
}

impl Run<'_> {
    async fn drive(&mut self) -> GatewayResult<()> {
        loop {
            while let Some(idx) = self.ready.pop_front() {
                self.dispatch(idx)?;
            }

            if self.tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(ConnectorError::cancelled().into());
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    log::warn!(
                        "pipeline {} exceeded its deadline with {} step(s) in flight",
                        self.pipeline.id,
                        self.tasks.len()
                    );
                    return Err(GatewayError::PipelineTimeout {
                        pipeline: self.pipeline.id.clone(),
                        step: None,
                    });
                }
                joined = self.tasks.join_next() => joined,
            };

            match joined {
                Some(Ok((idx, Ok(value)))) => self.complete(idx, Some(value)),
                Some(Ok((idx, Err(err)))) => {
                    let fallback = self.on_failure(idx, err)?;
                    self.complete(idx, Some(fallback));
                }
                Some(Err(join_err)) => {
                    return Err(internal_error!(
                        "pipeline {} lost a step task: {}",
                        self.pipeline.id,
                        join_err
                    ));
                }
                None => break,
            }
        }

        debug_assert_eq!(self.finished, self.pipeline.steps.len());
        Ok(())
    }

    /// Decide what happens to a ready step: skip it, fail it, or start it.
    fn dispatch(&mut self, idx: usize) -> GatewayResult<()> {
        let pipeline = self.pipeline;
        let step = &pipeline.steps[idx];

        if let Some(condition) = &step.condition {
            match self
                .engine
                .evaluator
                .evaluate_condition(condition, &self.bindings)
            {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!(
                        "pipeline {} skips step {}: `{}` is false",
                        self.pipeline.id,
                        step.name,
                        condition
                    );
                    self.complete(idx, None);
                    return Ok(());
                }
                Err(e) => {
                    let fallback = self.on_failure(idx, e.into())?;
                    self.complete(idx, Some(fallback));
                    return Ok(());
                }
            }
        }

        if let Some(missing) = step
            .required
            .iter()
            .find(|name| !self.bindings.contains_key(name.as_str()))
        {
            let err = GatewayError::BindingNotFound(missing.clone());
            let fallback = self.on_failure(idx, err)?;
            self.complete(idx, Some(fallback));
            return Ok(());
        }

        let step_timeout = self.engine.step_timeout(step);
        let run_deadline = self.deadline;
        let mut step_ctx = StepContext {
            pipeline: self.pipeline.id.clone(),
            step: step.name.clone(),
            request_id: self.ctx.request_id.clone(),
            client_id: self.ctx.client_id.clone(),
            bindings: Arc::new(self.bindings.clone()),
            cancel: self.cancel.child_token(),
            deadline: run_deadline,
        };
        let connector = step.connector.clone();
        let config = step.config.clone();
        let retries = step.retries;
        let backoff = step.retry_backoff;
        let local = self.local.clone();
        let global = self.engine.global.clone();

        self.tasks.spawn(async move {
            let name = step_ctx.step.clone();
            let attempt = async move {
                let _local = local
                    .acquire_owned()
                    .await
                    .map_err(|e| internal_error!("step semaphore closed: {}", e))?;
                let _global = global
                    .acquire_owned()
                    .await
                    .map_err(|e| internal_error!("engine semaphore closed: {}", e))?;
                // the step's own clock starts once it holds both permits
                step_ctx.deadline = (Instant::now() + step_timeout).min(run_deadline);
                execute_with_retries(&step_ctx, connector.as_ref(), &config, retries, backoff).await
            };
            let result = AssertUnwindSafe(attempt)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(internal_error!("step {} panicked", name)));
            (idx, result)
        });

        Ok(())
    }

    /// Apply the step's failure policy: the value to bind, or the error aborting the run.
    fn on_failure(&self, idx: usize, err: GatewayError) -> GatewayResult<JsonValue> {
        let step = &self.pipeline.steps[idx];
        match &step.on_failure {
            FailurePolicy::Tolerated { default } => {
                log::warn!(
                    "pipeline {} step {} failed, using default: {}",
                    self.pipeline.id,
                    step.name,
                    err
                );
                Ok(default.clone())
            }
            FailurePolicy::Fatal => {
                log::error!(
                    "pipeline {} aborted by step {}: {}",
                    self.pipeline.id,
                    step.name,
                    err
                );
                Err(match err {
                    GatewayError::Connector(ref e) if e.origin == ErrorOrigin::Timeout => {
                        GatewayError::PipelineTimeout {
                            pipeline: self.pipeline.id.clone(),
                            step: Some(step.name.clone()),
                        }
                    }
                    other => GatewayError::FatalStep {
                        pipeline: self.pipeline.id.clone(),
                        step: step.name.clone(),
                        source: Box::new(other),
                    },
                })
            }
        }
    }

    /// Record a finished (or skipped, when `value` is `None`) step and release its dependents.
    fn complete(&mut self, idx: usize, value: Option<JsonValue>) {
        self.finished += 1;
        if let Some(value) = value {
            let binding = self.pipeline.steps[idx].binding.clone();
            self.bindings.insert(binding, value);
        }
        for &next in &self.pipeline.dependents[idx] {
            self.waiting[next] -= 1;
            if self.waiting[next] == 0 {
                self.ready.push_back(next);
            }
        }
    }
}

/// Call the connector until it succeeds, fails for good, or runs out of time.
async fn execute_with_retries(
    ctx: &StepContext,
    connector: &dyn Connector,
    config: &ParsedConfig,
    retries: u32,
    backoff: Duration,
) -> GatewayResult<JsonValue> {
    let mut attempts = 0;
    loop {
        let err = match tokio::time::timeout_at(ctx.deadline, connector.execute(ctx, config)).await
        {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => ConnectorError::timeout(format!("step {} timed out", ctx.step)).into(),
        };

        STEP_FAILURES
            .with_label_values(&[ctx.pipeline.as_str(), ctx.step.as_str(), origin_label(&err)])
            .inc();

        let retryable = matches!(&err, GatewayError::Connector(e) if e.origin.is_retryable());
        if !retryable
            || attempts >= retries
            || ctx.cancel.is_cancelled()
            || Instant::now() + backoff >= ctx.deadline
        {
            return Err(err);
        }

        attempts += 1;
        log::warn!(
            "pipeline {} step {} failed ({}), retry {}/{}",
            ctx.pipeline,
            ctx.step,
            err,
            attempts,
            retries
        );
        tokio::time::sleep(backoff).await;
    }
}

fn origin_label(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Connector(e) => e.origin.as_str(),
        GatewayError::BindingNotFound(_) | GatewayError::Expression(_) => "client",
        _ => "server",
    }
}

/// Keep the declared output bindings, or every step binding when none are declared.
fn collect_output(
    pipeline: &CompiledPipeline,
    mut bindings: Map<String, JsonValue>,
) -> Map<String, JsonValue> {
    let mut output = Map::new();
    if pipeline.output.is_empty() {
        for step in &pipeline.steps {
            if let Some(value) = bindings.remove(&step.binding) {
                output.insert(step.binding.clone(), value);
            }
        }
    } else {
        for name in &pipeline.output {
            if let Some(value) = bindings.remove(name) {
                output.insert(name.clone(), value);
            }
        }
    }
    output
}
