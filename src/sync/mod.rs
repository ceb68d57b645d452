//! Reconciling generated output with the files on disk.
//!
//! Every sync compares three versions of each file: the **baseline** the
//! previous sync generated, the **working** copy currently on disk, and the
//! freshly **generated** one. Files nobody touched are fast-forwarded, user
//! edits are merged line by line, and overlapping edits are left in the file
//! between conflict markers. Nothing is written until the whole plan has been
//! computed, so a failing generator never leaves a half-synced tree behind.

mod apply;
mod commands;
mod diff;
mod merge;
mod metadata;
mod plan;

use std::collections::HashSet;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::{Diagnostics, Generation, generate_with};
use crate::error::{SyncError, WriteError};
use crate::format::FormatterSet;
use crate::io::as_overhead;
use crate::output::PostWriteCommand;
use crate::tree::GeneratorNode;

pub use commands::CommandOutcome;
pub use merge::{ConflictLabels, MergeResult, merge_text};
pub use metadata::{FileRecord, METADATA_VERSION, SyncMetadata};

use metadata::Snapshot;

pub const DEFAULT_METADATA_DIR: &str = ".tsugite";

const METADATA_FILE: &str = "metadata.json";
const SNAPSHOT_DIR: &str = "generated";

/// Configuration of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Directory under the output root holding the sync metadata and the
    /// baseline snapshot. Generators can't write into it.
    pub metadata_dir: Utf8PathBuf,
    pub conflict_labels: ConflictLabels,
    /// Commands that run even when their `only_if_changed` patterns match
    /// nothing.
    pub rerun_commands: Vec<String>,
    pub skip_commands_on_conflict: bool,
    pub run_commands: bool,
    /// Compute everything, write nothing.
    pub dry_run: bool,
    #[serde(skip, default = "FormatterSet::standard")]
    pub formatters: FormatterSet,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            metadata_dir: DEFAULT_METADATA_DIR.into(),
            conflict_labels: ConflictLabels::default(),
            rerun_commands: Vec::new(),
            skip_commands_on_conflict: true,
            run_commands: true,
            dry_run: false,
            formatters: FormatterSet::standard(),
        }
    }
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.metadata_dir = dir.into();
        self
    }

    pub fn conflict_labels(mut self, existing: impl Into<String>, generated: impl Into<String>) -> Self {
        self.conflict_labels = ConflictLabels {
            existing: existing.into(),
            generated: generated.into(),
        };
        self
    }

    pub fn rerun_command(mut self, command: impl Into<String>) -> Self {
        self.rerun_commands.push(command.into());
        self
    }

    pub fn skip_commands_on_conflict(mut self, skip: bool) -> Self {
        self.skip_commands_on_conflict = skip;
        self
    }

    pub fn run_commands(mut self, run: bool) -> Self {
        self.run_commands = run;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn formatters(mut self, formatters: FormatterSet) -> Self {
        self.formatters = formatters;
        self
    }

    pub fn metadata_path(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.metadata_dir).join(METADATA_FILE)
    }

    pub fn snapshot_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.metadata_dir).join(SNAPSHOT_DIR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Conflict markers were written into the file.
    Text,
    /// The working file was kept; the generated contents went next to it.
    Binary { generated_path: Utf8PathBuf },
    /// The file moved and couldn't be merged cleanly. The new path holds the
    /// merge, the old path was left in place.
    Rename { from: Utf8PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub id: String,
    pub path: Utf8PathBuf,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedFile {
    pub id: String,
    pub from: Utf8PathBuf,
    pub to: Utf8PathBuf,
}

/// The report of a sync run.
#[derive(Debug)]
pub struct SyncResult {
    pub written_files: Vec<Utf8PathBuf>,
    pub deleted_files: Vec<Utf8PathBuf>,
    pub renamed_files: Vec<RenamedFile>,
    pub conflicts: Vec<Conflict>,
    /// Files that are no longer generated but were edited, so they were kept.
    pub orphaned_files: Vec<Utf8PathBuf>,
    pub commands_run: Vec<CommandOutcome>,
    pub skipped_commands: Vec<PostWriteCommand>,
    pub failed_writes: Vec<WriteError>,
    /// The metadata to pass to the next sync.
    pub metadata: SyncMetadata,
    pub diagnostics: Diagnostics,
}

impl SyncResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether the sync went through without conflicts, failed writes or
    /// failed commands.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
            && self.failed_writes.is_empty()
            && self.commands_run.iter().all(|outcome| outcome.success)
    }
}

/// Runs the generator tree without touching the disk.
pub fn generate(tree: &GeneratorNode) -> Result<Generation, SyncError> {
    generate_with(tree, Some(Utf8Path::new(DEFAULT_METADATA_DIR)))
}

/// Generates `tree` and reconciles the result with the files under `root`.
///
/// `previous` is the metadata returned by the last sync. The baseline
/// snapshot under the metadata directory is updated here, but persisting the
/// returned metadata is left to the caller; [`sync_project`] does both.
pub fn run_sync(
    tree: &GeneratorNode,
    root: &Utf8Path,
    previous: &SyncMetadata,
    options: &SyncOptions,
) -> Result<SyncResult, SyncError> {
    let s = Instant::now();

    let Generation {
        mut output,
        diagnostics,
    } = generate_with(tree, Some(options.metadata_dir.as_path()))?;

    options.formatters.apply(&mut output)?;

    let snapshot = Snapshot::new(options.snapshot_dir(root));
    let plan = plan::plan(root, &output, previous, &snapshot, &options.conflict_labels)?;

    tracing::info!(
        "Planned {} writes and {} removals {}",
        plan.writes.len(),
        plan.removes.len(),
        as_overhead(s)
    );

    let mut result = SyncResult {
        written_files: Vec::new(),
        deleted_files: Vec::new(),
        renamed_files: plan.renamed.clone(),
        conflicts: plan.conflicts.clone(),
        orphaned_files: plan.orphaned.clone(),
        commands_run: Vec::new(),
        skipped_commands: Vec::new(),
        failed_writes: Vec::new(),
        metadata: SyncMetadata::new(),
        diagnostics,
    };

    if options.dry_run {
        result.written_files = plan.writes.iter().map(|w| w.path.clone()).collect();
        result.deleted_files = plan.removes.iter().map(|r| r.path.clone()).collect();
        result.metadata.files = plan.records;

        let modified = modified_paths(&result);
        result.skipped_commands = commands::select(&output.commands, &modified, &options.rerun_commands)
            .into_iter()
            .cloned()
            .collect();

        return Ok(result);
    }

    let applied = apply::apply(root, &plan);

    // Failed ids keep whatever the previous sync knew about them.
    let mut records = plan.records.clone();
    for id in &applied.failed {
        match previous.files.get(id) {
            Some(record) => records.insert(id.clone(), record.clone()),
            None => records.remove(id),
        };
    }

    let keep: HashSet<&Utf8Path> = applied
        .failed
        .iter()
        .filter_map(|id| previous.files.get(id))
        .map(|record| record.path.as_path())
        .collect();

    result.failed_writes = applied.errors;
    result
        .failed_writes
        .extend(apply::update_snapshot(&snapshot, &plan, &applied.failed, &keep));

    result.written_files = applied.written;
    result.deleted_files = applied.deleted;
    result.metadata.files = records;

    let modified = modified_paths(&result);
    let selected = commands::select(&output.commands, &modified, &options.rerun_commands);

    if !options.run_commands || (options.skip_commands_on_conflict && result.has_conflicts()) {
        if !selected.is_empty() {
            tracing::warn!("Skipping {} post-write commands", selected.len());
        }
        result.skipped_commands = selected.into_iter().cloned().collect();
    } else {
        for command in selected {
            result.commands_run.push(commands::execute(root, command));
        }
    }

    tracing::info!(
        "Synced {} files, removed {}, {} conflicts {}",
        result.written_files.len(),
        result.deleted_files.len(),
        result.conflicts.len(),
        as_overhead(s)
    );

    Ok(result)
}

/// Syncs `tree` into `root`, loading the metadata of the previous sync from
/// the metadata directory and saving the new one there.
///
/// A metadata file that can't be saved is reported in
/// [`SyncResult::failed_writes`].
pub fn sync_project(
    tree: &GeneratorNode,
    root: &Utf8Path,
    options: &SyncOptions,
) -> Result<SyncResult, SyncError> {
    let path = options.metadata_path(root);
    let previous = SyncMetadata::load(&path)?;

    let mut result = run_sync(tree, root, &previous, options)?;

    if !options.dry_run {
        if let Err(e) = result.metadata.save(&path) {
            tracing::warn!("{e}");
            result.failed_writes.push(e.into());
        }
    }

    Ok(result)
}

fn modified_paths(result: &SyncResult) -> Vec<Utf8PathBuf> {
    result
        .written_files
        .iter()
        .chain(&result.deleted_files)
        .cloned()
        .collect()
}
