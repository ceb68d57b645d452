use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::{NodePath, TaskId};
use crate::provider::Scope;

/// Everything that can abort a sync run.
///
/// Merge conflicts and orphaned files are not errors; they are reported in
/// the [`SyncResult`](crate::SyncResult) of a run that otherwise succeeded.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid generator configuration.\n{0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Task '{task}' requires provider '{provider}', but nothing in scope exports it")]
    ProviderNotFound { provider: String, task: TaskId },

    #[error(transparent)]
    Task(#[from] TaskExecutionError),

    #[error("Task '{task}' contributed key '{key}' to provider '{provider}', which is already taken")]
    DuplicateKey {
        provider: String,
        key: String,
        task: TaskId,
    },

    #[error("Formatter '{formatter}' failed on '{path}'.\n{source}")]
    Format {
        formatter: String,
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Couldn't read working file '{path}'.\n{source}")]
    ReadWorking {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Errors in the shape of the generator tree or its provider wiring. These
/// are detected before any task runs (or, for output paths, before anything
/// is written) and are never partially applied.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Cycle detected in task graph: {}", format_cycle(.0))]
    Cycle(Vec<TaskId>),

    #[error("Provider '{provider}' ({scope}) is exported by both '{first}' and '{second}'")]
    AmbiguousProvider {
        provider: String,
        scope: Scope,
        first: TaskId,
        second: TaskId,
    },

    #[error("Task '{task}' expects provider '{provider}' to be {expected}, but '{producer}' exports {found}")]
    ProviderTypeMismatch {
        provider: String,
        task: TaskId,
        producer: TaskId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Task '{task}' depends on provider '{provider}', which it exports itself")]
    SelfDependency { provider: String, task: TaskId },

    #[error("Generator node '{0}' is defined more than once")]
    DuplicateNode(NodePath),

    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(TaskId),

    #[error("Output path '{path}' is written by both '{first}' and '{second}'")]
    DuplicateOutputPath {
        path: Utf8PathBuf,
        first: TaskId,
        second: TaskId,
    },

    #[error("File id '{id}' is used by both '{first}' and '{second}'")]
    DuplicateFileId {
        id: String,
        first: TaskId,
        second: TaskId,
    },

    #[error("Task '{task}' produced an invalid output path '{path}': {reason}")]
    InvalidOutputPath {
        path: Utf8PathBuf,
        task: TaskId,
        reason: &'static str,
    },
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The phase a task was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Run,
    Build,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Run => write!(f, "run"),
            Phase::Build => write!(f, "build"),
        }
    }
}

/// A `run` or `build` closure returned an error or panicked.
#[derive(Debug, Error)]
#[error("Task '{task}' failed during {phase}.\n{source}")]
pub struct TaskExecutionError {
    pub task: TaskId,
    pub phase: Phase,
    pub source: anyhow::Error,
}

/// Errors raised by the provider accessors available to task closures.
///
/// Task closures return `anyhow::Result`, so these usually travel through
/// `?`. The scheduler recognizes [`ProviderError::DuplicateKey`] on the way
/// out and reports it as [`SyncError::DuplicateKey`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider '{0}' was not declared by this task")]
    NotDeclared(String),

    #[error("Provider '{0}' has no value yet")]
    Unavailable(String),

    #[error("Provider '{provider}' does not hold a value of type {expected}")]
    TypeMismatch {
        provider: String,
        expected: &'static str,
    },

    #[error("Key '{key}' was already contributed to provider '{provider}' by '{owner}'")]
    DuplicateKey {
        provider: String,
        key: String,
        owner: TaskId,
    },

    #[error("Provider '{0}' is not exported by this task")]
    NotExported(String),

    #[error("Provider '{0}' was provided more than once")]
    AlreadyProvided(String),

    #[error("Provider '{0}' is declared as an export but was never provided")]
    MissingExport(String),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Couldn't access sync metadata at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Sync metadata at '{path}' is malformed.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Sync metadata at '{path}' has unsupported version {version}")]
    UnsupportedVersion { path: Utf8PathBuf, version: u32 },
}

/// A filesystem operation of the write phase that failed. These are
/// collected per file in the [`SyncResult`](crate::SyncResult); the rest of
/// the sync still goes through.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Couldn't write '{path}'.\n{source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't remove '{path}'.\n{source}")]
    Remove {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't update the baseline snapshot of '{path}'.\n{source}")]
    Snapshot {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl WriteError {
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            WriteError::Write { path, .. }
            | WriteError::Remove { path, .. }
            | WriteError::Snapshot { path, .. } => Some(path),
            WriteError::Metadata(_) => None,
        }
    }
}
