//! Lifecycle surface the allocation runner drives hooks through.

use async_trait::async_trait;

/// Any allocation runner hook.
pub trait RunnerHook: Send + Sync {
    /// Stable identifier, used for logging.
    fn name(&self) -> &'static str;
}

/// Hook run once before the allocation's tasks start. An error aborts
/// allocation startup.
#[async_trait]
pub trait PrerunHook: RunnerHook {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn prerun(&self) -> Result<(), Self::Error>;
}

/// Why a task is being stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStopRequest {
    /// Task being stopped, if a single one.
    pub task: Option<String>,
    pub reason: Option<String>,
}

impl TaskStopRequest {
    pub fn for_task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            reason: None,
        }
    }
}

/// Hook notified when tasks stop.
#[async_trait]
pub trait TaskStopHook: RunnerHook {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn stop(&self, request: &TaskStopRequest) -> Result<(), Self::Error>;
}

/// Hook notified on agent shutdown. Must not block.
pub trait ShutdownHook: RunnerHook {
    fn shutdown(&self);
}
