use crate::engine::Orchestrator;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub engine: Orchestrator,
    pub scheduler: Scheduler,
}
