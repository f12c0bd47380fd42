//! Load-time compilation of pipeline definitions.
//!
//! Everything that can be checked without a request is checked here: dependency names,
//! acyclicity, connector types, connector configuration and condition syntax. A pipeline
//! that compiles never fails a request for one of those reasons.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde_json::Value as JsonValue;

use crate::{
    config::{FailurePolicy, PipelineSpec, StepSpec},
    config_error,
    connector::ConnectorRegistry,
    core::{Connector, ExpressionEvaluator, GatewayResult, ParsedConfig},
};

pub struct CompiledStep {
    pub name: String,
    /// Name the step's result is bound under
    pub binding: String,
    pub connector: Arc<dyn Connector>,
    pub config: ParsedConfig,
    pub condition: Option<String>,
    pub on_failure: FailurePolicy,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Indexes of the steps that must finish before this one starts
    pub deps: Vec<usize>,
    /// Bindings that must be present once the step is ready
    pub required: Vec<String>,
}

pub struct CompiledPipeline {
    pub id: String,
    pub steps: Vec<CompiledStep>,
    /// Reverse edges, `dependents[i]` waits for step `i`
    pub dependents: Vec<Vec<usize>>,
    pub output: Vec<String>,
    pub timeout: Option<Duration>,
    pub max_concurrency: usize,
}

impl CompiledPipeline {
    pub fn compile(
        spec: &PipelineSpec,
        connectors: &ConnectorRegistry,
        evaluator: &dyn ExpressionEvaluator,
    ) -> GatewayResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in spec.steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(config_error!(
                    "Pipeline {} declares step {} twice",
                    spec.id,
                    step.name
                ));
            }
        }
        // bindings may be referenced by their own name too
        for (i, step) in spec.steps.iter().enumerate() {
            index.entry(step.binding()).or_insert(i);
        }

        let mut steps = Vec::with_capacity(spec.steps.len());
        for step in &spec.steps {
            steps.push(compile_step(spec, step, &index, connectors, evaluator)?);
        }

        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for &dep in &step.deps {
                dependents[dep].push(i);
            }
        }

        check_acyclic(&spec.id, &steps, &dependents)?;

        for name in &spec.output {
            if !steps.iter().any(|s| &s.binding == name) {
                return Err(config_error!(
                    "Pipeline {} outputs unknown binding {}",
                    spec.id,
                    name
                ));
            }
        }

        Ok(Self {
            id: spec.id.clone(),
            max_concurrency: spec.max_concurrency.unwrap_or(steps.len()).max(1),
            steps,
            dependents,
            output: spec.output.clone(),
            timeout: spec.timeout_ms.map(Duration::from_millis),
        })
    }
}

fn compile_step(
    pipeline: &PipelineSpec,
    step: &StepSpec,
    index: &HashMap<&str, usize>,
    connectors: &ConnectorRegistry,
    evaluator: &dyn ExpressionEvaluator,
) -> GatewayResult<CompiledStep> {
    let resolve = |name: &str| {
        index.get(name).copied().ok_or_else(|| {
            config_error!(
                "Step {} of pipeline {} depends on unknown step {}",
                step.name,
                pipeline.id,
                name
            )
        })
    };

    let mut deps = Vec::new();
    for name in step.depends_on.iter().chain(step.requires.iter()) {
        let dep = resolve(name)?;
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }

    let required = step
        .requires
        .iter()
        .map(|name| resolve(name).map(|i| pipeline.steps[i].binding().to_string()))
        .collect::<GatewayResult<Vec<_>>>()?;

    let connector = connectors.lookup(&step.connector).ok_or_else(|| {
        config_error!(
            "Step {} of pipeline {} uses unknown connector type {}",
            step.name,
            pipeline.id,
            step.connector
        )
    })?;

    let raw = if step.config.is_null() {
        JsonValue::Object(Default::default())
    } else {
        step.config.clone()
    };
    let config = connector.validate_config(&raw).map_err(|e| {
        config_error!(
            "Step {} of pipeline {} has invalid {} config: {}",
            step.name,
            pipeline.id,
            step.connector,
            e
        )
    })?;

    if let Some(condition) = &step.condition {
        evaluator.check(condition).map_err(|e| {
            config_error!(
                "Step {} of pipeline {} has invalid condition `{}`: {}",
                step.name,
                pipeline.id,
                condition,
                e
            )
        })?;
    }

    Ok(CompiledStep {
        name: step.name.clone(),
        binding: step.binding().to_string(),
        connector,
        config,
        condition: step.condition.clone(),
        on_failure: step.on_failure.clone(),
        timeout: step.timeout_ms.map(Duration::from_millis),
        retries: step.retries,
        retry_backoff: Duration::from_millis(step.retry_backoff_ms),
        deps,
        required,
    })
}

/// Kahn's algorithm; any step never reaching in-degree zero sits on a cycle.
fn check_acyclic(
    pipeline: &str,
    steps: &[CompiledStep],
    dependents: &[Vec<usize>],
) -> GatewayResult<()> {
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.deps.len()).collect();
    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;

    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != steps.len() {
        let cyclic: Vec<&str> = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].name.as_str())
            .collect();
        return Err(config_error!(
            "Pipeline {} has a dependency cycle through steps {}",
            pipeline,
            cyclic.join(", ")
        ));
    }

    Ok(())
}
