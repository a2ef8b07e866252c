use super::metrics::{SagaMetrics, StageMetrics, StepMetrics};
use super::stage::{Stage, StageMode};
use super::step::BoxedStep;
use futures::future::try_join_all;
use sovereign_shared::errors::SovereignResult;
use tokio::time::Instant;

/// A named, ordered plan of stages.
pub struct Saga<Ctx> {
    name: &'static str,
    stages: Vec<Stage<BoxedStep<Ctx>>>,
}

impl<Ctx> Saga<Ctx> {
    pub fn new(name: &'static str, stages: Vec<Stage<BoxedStep<Ctx>>>) -> Self {
        Self { name, stages }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct SagaRunner;

impl SagaRunner {
    /// Run every stage in order, aborting at the first failing step.
    pub async fn run<Ctx>(saga: Saga<Ctx>, ctx: Ctx) -> SovereignResult<SagaMetrics>
    where
        Ctx: Clone,
    {
        let saga_name = saga.name;
        let total_start = Instant::now();
        let mut stage_metrics = Vec::with_capacity(saga.stages.len());

        for (index, stage) in saga.stages.into_iter().enumerate() {
            let mode = stage.mode;
            let stage_start = Instant::now();

            let steps = match mode {
                StageMode::Concurrent => {
                    let futures = stage.steps.into_iter().map(|step| {
                        let ctx = ctx.clone();
                        async move { run_step(saga_name, step, ctx).await }
                    });
                    try_join_all(futures).await?
                }
                StageMode::Sequential => {
                    let mut steps = Vec::new();
                    for step in stage.steps {
                        steps.push(run_step(saga_name, step, ctx.clone()).await?);
                    }
                    steps
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                mode,
                duration_ms: stage_start.elapsed().as_millis(),
                steps,
            });
        }

        Ok(SagaMetrics {
            saga: saga_name,
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}

async fn run_step<Ctx>(saga: &'static str, step: BoxedStep<Ctx>, ctx: Ctx) -> SovereignResult<StepMetrics> {
    let name = step.name();
    let start = Instant::now();
    tracing::debug!(saga, step = name, "Step started");
    step.run(ctx)
        .await
        .inspect_err(|e| tracing::error!(saga, step = name, error = %e, "Step failed"))?;
    Ok(StepMetrics {
        name,
        duration_ms: start.elapsed().as_millis(),
    })
}
