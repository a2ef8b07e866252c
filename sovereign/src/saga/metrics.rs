use super::stage::StageMode;

#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub name: &'static str,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub mode: StageMode,
    pub duration_ms: u128,
    pub steps: Vec<StepMetrics>,
}

#[derive(Debug, Clone)]
pub struct SagaMetrics {
    pub saga: &'static str,
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl SagaMetrics {
    pub fn step_duration_ms(&self, name: &str) -> Option<u128> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .find(|step| step.name == name)
            .map(|step| step.duration_ms)
    }

    /// Step names in completion order.
    pub fn completed_steps(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter().map(|s| s.name))
            .collect()
    }

    pub fn log_summary(&self) {
        for stage in &self.stages {
            for step in &stage.steps {
                tracing::debug!(
                    saga = self.saga,
                    stage = stage.index,
                    step = step.name,
                    duration_ms = step.duration_ms as u64,
                    "Step timing"
                );
            }
        }
        tracing::info!(
            saga = self.saga,
            steps = self.completed_steps().len(),
            total_ms = self.total_duration_ms as u64,
            "Saga complete"
        );
    }
}
