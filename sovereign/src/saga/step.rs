use async_trait::async_trait;
use sovereign_shared::errors::SovereignResult;

/// One step of a saga, run against a shared context.
///
/// The context is cloned per step; use `Arc` plus interior mutability for
/// anything a later step needs to read.
#[async_trait]
pub trait SagaStep<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> SovereignResult<()>;

    /// Stable name used in logs and metrics.
    fn name(&self) -> &'static str;
}

pub type BoxedStep<Ctx> = Box<dyn SagaStep<Ctx>>;
