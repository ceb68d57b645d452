//! Task graph construction and the two-phase scheduler.
//!
//! Tasks execute in two phases. During **run**, tasks are scheduled in
//! parallel as soon as the producers of their run-phase dependencies have
//! finished; they publish single-valued providers and contribute to additive
//! ones. Once every task has run, the provider store is frozen and the
//! **build** phase renders files and post-write commands from the final
//! values.

mod context;
mod graph;
mod runner;

use camino::Utf8Path;

use crate::error::SyncError;
use crate::output::GeneratorOutput;
use crate::tree::GeneratorNode;

pub use context::{BuildContext, RunContext, RunOutput};
pub(crate) use context::{BuildFn, RunFn};
pub(crate) use graph::TaskGraph;
pub(crate) use runner::BuildOutput;
pub use runner::{Diagnostics, TaskDiagnostics, TaskExecution};

/// Everything a generator tree produced, before anything touches the disk.
#[derive(Debug)]
pub struct Generation {
    pub output: GeneratorOutput,
    pub diagnostics: Diagnostics,
}

/// Runs both phases for `tree` and collects the generated files.
///
/// Output paths inside `reserved` are rejected.
pub(crate) fn generate_with(
    tree: &GeneratorNode,
    reserved: Option<&Utf8Path>,
) -> Result<Generation, SyncError> {
    let graph = TaskGraph::build(tree)?;
    let (outputs, diagnostics) = runner::execute(&graph)?;
    let output = GeneratorOutput::collect(&graph, outputs, reserved)?;

    tracing::debug!(
        files = output.files.len(),
        commands = output.commands.len(),
        "generator output collected"
    );

    Ok(Generation {
        output,
        diagnostics,
    })
}
