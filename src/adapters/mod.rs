use std::sync::Arc;

use crate::core::command::CommandRunner;

mod simulated;
mod system;

pub use simulated::SimulatedRunner;
pub use system::SystemRunner;

pub fn get_runner(simulation: bool) -> Arc<dyn CommandRunner> {
    if simulation {
        tracing::warn!("Simulation mode: datalad, git and the validator are emulated");
        return Arc::new(SimulatedRunner::new());
    }

    Arc::new(SystemRunner)
}
