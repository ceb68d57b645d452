#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
mod format;
mod io;
mod output;
mod provider;
mod sync;
mod tree;

pub use crate::core::{Hash32, NodePath, TaskId};
pub use crate::engine::{
    BuildContext, Diagnostics, Generation, RunContext, RunOutput, TaskDiagnostics, TaskExecution,
};
pub use crate::error::*;
pub use crate::format::{Formatter, FormatterSet, JsonFormatter, normalize_line_endings};
pub use crate::output::{FileContents, FileEntry, FileOptions, GeneratorOutput, PostWriteCommand};
pub use crate::provider::{AdditiveType, Collected, Collector, ProviderType, Scope};
pub use crate::sync::{
    CommandOutcome, Conflict, ConflictKind, ConflictLabels, DEFAULT_METADATA_DIR, FileRecord,
    METADATA_VERSION, MergeResult, RenamedFile, SyncMetadata, SyncOptions, SyncResult, generate,
    merge_text, run_sync, sync_project,
};
pub use crate::tree::{Generator, GeneratorNode, TaskDef};

/// Installs a global subscriber printing `tracing` events to stderr, with
/// progress bars for the scheduler phases. The filter is read from
/// `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();
}
