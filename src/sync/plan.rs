use std::collections::{BTreeMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::error::SyncError;
use crate::io::read_optional;
use crate::output::{FileOptions, GeneratorOutput};
use crate::sync::merge::{ConflictLabels, is_binary, merge_text};
use crate::sync::metadata::{FileRecord, Snapshot, SyncMetadata};
use crate::sync::{Conflict, ConflictKind, RenamedFile};

/// What the previous sync generated for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Baseline {
    Contents(Vec<u8>),
    /// The snapshot is gone; only the recorded hash is left.
    Fingerprint(Hash32),
    /// The id was never synced.
    Absent,
}

impl Baseline {
    fn load(record: Option<&FileRecord>, snapshot: &Snapshot) -> Self {
        let Some(record) = record else {
            return Baseline::Absent;
        };

        match snapshot.read(&record.path) {
            Ok(Some(bytes)) if Hash32::hash(&bytes) == record.hash => Baseline::Contents(bytes),
            _ => Baseline::Fingerprint(record.hash),
        }
    }

    fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            Baseline::Contents(baseline) => baseline == bytes,
            Baseline::Fingerprint(hash) => Hash32::hash(bytes) == *hash,
            Baseline::Absent => false,
        }
    }
}

/// The decision for one generated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Nothing on disk yet.
    Create,
    /// The working file already equals the generated one.
    Unchanged,
    /// The working file is untouched since the last sync.
    FastForward,
    /// The working file stays as it is.
    Keep,
    Merged(String),
    Conflict(String),
    BinaryConflict,
}

/// Decides what to do with one file given its three versions.
pub(crate) fn reconcile(
    baseline: &Baseline,
    working: Option<&[u8]>,
    generated: &[u8],
    options: FileOptions,
    labels: &ConflictLabels,
) -> Outcome {
    let Some(working) = working else {
        return Outcome::Create;
    };

    if options.never_overwrite {
        return Outcome::Keep;
    }

    if working == generated {
        return Outcome::Unchanged;
    }

    if *baseline == Baseline::Absent || baseline.matches(working) {
        return Outcome::FastForward;
    }

    if baseline.matches(generated) {
        return Outcome::Keep;
    }

    if is_binary(working) || is_binary(generated) {
        return Outcome::BinaryConflict;
    }

    let (Ok(working), Ok(generated)) = (std::str::from_utf8(working), std::str::from_utf8(generated))
    else {
        return Outcome::BinaryConflict;
    };

    // Without the snapshot the merge has no common ancestor to work from.
    let base = match baseline {
        Baseline::Contents(bytes) => std::str::from_utf8(bytes).unwrap_or_default(),
        _ => "",
    };

    let result = merge_text(base, working, generated, labels);
    match result.has_conflict {
        true => Outcome::Conflict(result.contents),
        false => Outcome::Merged(result.contents),
    }
}

/// The path generated contents go to when they can't be merged into a
/// binary working file: `logo.png` becomes `logo.generated.png`, then
/// `logo.generated.1.png` and so on for later attempts.
pub(crate) fn conflict_path(path: &Utf8Path, attempt: usize) -> Utf8PathBuf {
    let stem = path.file_stem().unwrap_or_default();
    let marker = match attempt {
        0 => String::from("generated"),
        n => format!("generated.{n}"),
    };
    let name = match path.extension() {
        Some(extension) => format!("{stem}.{marker}.{extension}"),
        None => format!("{stem}.{marker}"),
    };
    path.with_file_name(name)
}

/// The first conflict path that is neither generated nor tracked, and that no
/// earlier entry of the plan writes to.
fn sibling_path(
    path: &Utf8Path,
    output: &GeneratorOutput,
    previous: &SyncMetadata,
    plan: &Plan,
) -> Utf8PathBuf {
    (0..)
        .map(|attempt| conflict_path(path, attempt))
        .find(|candidate| {
            !output.files.contains_key(candidate.as_path())
                && previous.id_at(candidate).is_none()
                && !plan.writes.iter().any(|write| write.path == *candidate)
        })
        .unwrap_or_else(|| conflict_path(path, 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Write {
    pub id: String,
    pub path: Utf8PathBuf,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Remove {
    pub id: String,
    pub path: Utf8PathBuf,
}

/// Everything a sync is going to do, computed before touching the disk.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub writes: Vec<Write>,
    /// Applied after all writes.
    pub removes: Vec<Remove>,
    pub conflicts: Vec<Conflict>,
    pub orphaned: Vec<Utf8PathBuf>,
    pub renamed: Vec<RenamedFile>,
    /// The metadata records after this sync.
    pub records: BTreeMap<String, FileRecord>,
    pub snapshot_writes: Vec<Write>,
    pub snapshot_removes: Vec<Utf8PathBuf>,
}

impl Plan {
    fn write(&mut self, id: &str, path: &Utf8Path, contents: impl Into<Vec<u8>>) {
        self.writes.push(Write {
            id: id.to_string(),
            path: path.to_owned(),
            contents: contents.into(),
        });
    }

    fn remove(&mut self, id: &str, path: &Utf8Path) {
        self.removes.push(Remove {
            id: id.to_string(),
            path: path.to_owned(),
        });
    }

    fn conflict(&mut self, id: &str, path: &Utf8Path, kind: ConflictKind) {
        tracing::warn!("Conflict in {path}");
        self.conflicts.push(Conflict {
            id: id.to_string(),
            path: path.to_owned(),
            kind,
        });
    }
}

/// Computes the plan for syncing `output` into `root`.
pub(crate) fn plan(
    root: &Utf8Path,
    output: &GeneratorOutput,
    previous: &SyncMetadata,
    snapshot: &Snapshot,
    labels: &ConflictLabels,
) -> Result<Plan, SyncError> {
    let mut plan = Plan::default();

    let ids: HashSet<&str> = output.files.values().map(|entry| entry.id.as_str()).collect();
    let mut claimed: HashSet<&str> = HashSet::new();

    let read_working = |path: &Utf8Path| {
        read_optional(&root.join(path)).map_err(|source| SyncError::ReadWorking {
            path: path.to_owned(),
            source,
        })
    };

    for (path, entry) in &output.files {
        let id = entry.id.as_str();
        let generated = entry.contents.as_bytes();

        // A file whose id changed but whose path didn't keeps its history.
        let record = match previous.files.get_key_value(id) {
            Some((key, record)) => Some((key.as_str(), record)),
            None => previous
                .id_at(path)
                .filter(|other| !ids.contains(other))
                .and_then(|other| previous.files.get_key_value(other))
                .map(|(key, record)| (key.as_str(), record)),
        };

        if let Some((key, _)) = record {
            claimed.insert(key);
        }

        let record = record.map(|(_, record)| record);
        let renamed_from = record
            .map(|record| record.path.as_path())
            .filter(|old| *old != path.as_path());

        let working = read_working(renamed_from.unwrap_or(path))?;
        let baseline = Baseline::load(record, snapshot);
        let outcome = reconcile(&baseline, working.as_deref(), generated, entry.options, labels);

        tracing::debug!("{path}: {outcome:?}");

        match renamed_from {
            None => match outcome {
                Outcome::Create | Outcome::FastForward => plan.write(id, path, generated),
                Outcome::Unchanged | Outcome::Keep => {}
                Outcome::Merged(contents) => plan.write(id, path, contents),
                Outcome::Conflict(contents) => {
                    plan.write(id, path, contents);
                    plan.conflict(id, path, ConflictKind::Text);
                }
                Outcome::BinaryConflict => {
                    let sibling = sibling_path(path, output, previous, &plan);
                    plan.write(id, &sibling, generated);
                    plan.conflict(id, path, ConflictKind::Binary {
                        generated_path: sibling,
                    });
                }
            },
            Some(from) => {
                let clean = match outcome {
                    Outcome::Create | Outcome::FastForward | Outcome::Unchanged => {
                        plan.write(id, path, generated);
                        true
                    }
                    Outcome::Keep => {
                        plan.write(id, path, working.unwrap_or_default());
                        true
                    }
                    Outcome::Merged(contents) => {
                        plan.write(id, path, contents);
                        true
                    }
                    Outcome::Conflict(contents) => {
                        plan.write(id, path, contents);
                        false
                    }
                    Outcome::BinaryConflict => {
                        plan.write(id, path, generated);
                        false
                    }
                };

                if clean {
                    plan.remove(id, from);
                } else {
                    plan.conflict(id, path, ConflictKind::Rename {
                        from: from.to_owned(),
                    });
                }

                plan.renamed.push(RenamedFile {
                    id: id.to_string(),
                    from: from.to_owned(),
                    to: path.clone(),
                });
                plan.snapshot_removes.push(from.to_owned());
            }
        }

        plan.records.insert(
            id.to_string(),
            FileRecord {
                path: path.clone(),
                hash: Hash32::hash(generated),
            },
        );

        let snapshot_current =
            renamed_from.is_none() && matches!(&baseline, Baseline::Contents(bytes) if bytes == generated);

        if !snapshot_current {
            plan.snapshot_writes.push(Write {
                id: id.to_string(),
                path: path.clone(),
                contents: generated.to_vec(),
            });
        }
    }

    for (id, record) in &previous.files {
        if ids.contains(id.as_str()) || claimed.contains(id.as_str()) {
            continue;
        }

        // Another id generates this path now.
        if output.files.contains_key(&record.path) {
            continue;
        }

        plan.snapshot_removes.push(record.path.clone());

        let Some(working) = read_working(&record.path)? else {
            continue;
        };

        let baseline = Baseline::load(Some(record), snapshot);
        if baseline.matches(&working) {
            plan.remove(id, &record.path);
        } else {
            tracing::warn!("{} is no longer generated but was modified, keeping it", record.path);
            plan.orphaned.push(record.path.clone());
        }
    }

    let written: HashSet<Utf8PathBuf> = plan.writes.iter().map(|write| write.path.clone()).collect();
    plan.removes.retain(|remove| !written.contains(&remove.path));
    plan.snapshot_removes
        .retain(|path| !output.files.contains_key(path));

    Ok(plan)
}
