//! Generated files and post-write commands.
//!
//! Tasks emit [`FileEntry`] values and [`PostWriteCommand`]s from their build
//! phase. The scheduler gathers them into a [`GeneratorOutput`], which is
//! what the sync engine reconciles against the disk.

use std::collections::BTreeMap;
use std::collections::HashMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::TaskId;
use crate::engine::{BuildOutput, TaskGraph};
use crate::error::ConfigurationError;

/// The content of a [`FileEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileContents {
    /// Text content (UTF-8).
    Utf8(String),
    /// Binary content (raw bytes).
    Binary(Vec<u8>),
}

impl FileContents {
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContents::Utf8(text) => Some(text),
            FileContents::Binary(_) => None,
        }
    }
}

impl AsRef<[u8]> for FileContents {
    fn as_ref(&self) -> &[u8] {
        match self {
            FileContents::Utf8(s) => s.as_bytes(),
            FileContents::Binary(b) => b.as_slice(),
        }
    }
}

/// Per-file switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// Keep the contents exactly as generated, bypassing every formatter.
    pub skip_formatting: bool,
    /// Only ever create this file. Once it exists on disk it belongs to the
    /// user and is never touched again.
    pub never_overwrite: bool,
}

/// A single generated file.
///
/// The `id` identifies the file across regenerations. As long as a
/// generator keeps emitting the same id, moving the file to another `path`
/// is tracked as a rename rather than a delete plus a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: String,
    /// Destination, relative to the output root.
    pub path: Utf8PathBuf,
    pub contents: FileContents,
    pub options: FileOptions,
}

impl FileEntry {
    pub fn text(
        id: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            contents: FileContents::Utf8(contents.into()),
            options: FileOptions::default(),
        }
    }

    pub fn binary(
        id: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            contents: FileContents::Binary(contents.into()),
            options: FileOptions::default(),
        }
    }

    pub fn skip_formatting(mut self) -> Self {
        self.options.skip_formatting = true;
        self
    }

    pub fn never_overwrite(mut self) -> Self {
        self.options.never_overwrite = true;
        self
    }
}

/// A shell command to execute after the files of a sync have been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostWriteCommand {
    pub command: String,
    /// Glob patterns over relative paths. When set, the command only runs if
    /// one of the paths written or deleted by this sync matches.
    pub only_if_changed: Option<Vec<String>>,
    /// Relative to the output root. Defaults to the root itself.
    pub working_directory: Option<Utf8PathBuf>,
    /// Lower runs first. Commands with equal priority keep their order.
    pub priority: i32,
}

impl PostWriteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            only_if_changed: None,
            working_directory: None,
            priority: 0,
        }
    }

    pub fn only_if_changed<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_if_changed = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Everything a generator tree emitted in one run, keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct GeneratorOutput {
    pub files: BTreeMap<Utf8PathBuf, FileEntry>,
    pub commands: Vec<PostWriteCommand>,
}

impl GeneratorOutput {
    /// Gathers build outputs in the order given, normalizing every path and
    /// rejecting duplicate paths and ids.
    pub(crate) fn collect(
        graph: &TaskGraph,
        outputs: Vec<BuildOutput>,
        reserved: Option<&Utf8Path>,
    ) -> Result<Self, ConfigurationError> {
        let mut files = BTreeMap::new();
        let mut commands = Vec::new();
        let mut path_owners: HashMap<Utf8PathBuf, &TaskId> = HashMap::new();
        let mut id_owners: HashMap<String, &TaskId> = HashMap::new();

        for output in outputs {
            let task = graph.id(output.task);

            for mut entry in output.files {
                let path = validate_output_path(&entry.path, reserved).map_err(|reason| {
                    ConfigurationError::InvalidOutputPath {
                        path: entry.path.clone(),
                        task: task.clone(),
                        reason,
                    }
                })?;

                if let Some(first) = path_owners.insert(path.clone(), task) {
                    return Err(ConfigurationError::DuplicateOutputPath {
                        path,
                        first: first.clone(),
                        second: task.clone(),
                    });
                }

                if let Some(first) = id_owners.insert(entry.id.clone(), task) {
                    return Err(ConfigurationError::DuplicateFileId {
                        id: entry.id,
                        first: first.clone(),
                        second: task.clone(),
                    });
                }

                entry.path = path.clone();
                files.insert(path, entry);
            }

            commands.extend(output.commands);
        }

        Ok(Self { files, commands })
    }
}

/// Normalizes a generated path and checks that it stays inside the output
/// root and outside the `reserved` directory.
pub(crate) fn validate_output_path(
    path: &Utf8Path,
    reserved: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, &'static str> {
    if path.has_root() || path.is_absolute() {
        return Err("absolute paths are not allowed");
    }

    let normalized = normalize_path(path);

    if normalized.as_str().is_empty() {
        return Err("the path is empty");
    }

    if normalized.starts_with("..") {
        return Err("the path escapes the output root");
    }

    if let Some(reserved) = reserved {
        if normalized.starts_with(reserved) {
            return Err("the path is inside the sync metadata directory");
        }
    }

    Ok(normalized)
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// A leading `..` that cannot be collapsed is kept, so callers can tell a
/// path escaping its root apart from one that doesn't.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::Prefix(prefix) => ret.push(prefix.as_str()),
            Utf8Component::RootDir => ret.push(Utf8Component::RootDir),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => ret.push(c),
        }
    }

    ret
}
