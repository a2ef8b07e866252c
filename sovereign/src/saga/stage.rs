#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// All steps polled together; the first error wins.
    Concurrent,
    /// Steps run in declaration order.
    Sequential,
}

pub struct Stage<T> {
    pub steps: Vec<T>,
    pub mode: StageMode,
}

impl<T> Stage<T> {
    pub fn concurrent(steps: Vec<T>) -> Self {
        Self {
            steps,
            mode: StageMode::Concurrent,
        }
    }

    pub fn sequential(steps: Vec<T>) -> Self {
        Self {
            steps,
            mode: StageMode::Sequential,
        }
    }
}
