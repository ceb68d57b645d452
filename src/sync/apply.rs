use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::error::WriteError;
use crate::io::{remove_file, write_file};
use crate::sync::metadata::Snapshot;
use crate::sync::plan::Plan;

/// What actually happened on disk.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub written: Vec<Utf8PathBuf>,
    pub deleted: Vec<Utf8PathBuf>,
    pub errors: Vec<WriteError>,
    /// File ids with at least one failed operation.
    pub failed: HashSet<String>,
}

/// Writes every planned file, then performs the removals. There is no
/// rollback: each failure is recorded and the rest goes through.
pub(crate) fn apply(root: &Utf8Path, plan: &Plan) -> Applied {
    let mut applied = Applied::default();

    let results: Vec<_> = plan
        .writes
        .par_iter()
        .map(|write| (write, write_file(&root.join(&write.path), &write.contents)))
        .collect();

    for (write, result) in results {
        match result {
            Ok(()) => {
                tracing::debug!("Wrote {}", write.path);
                applied.written.push(write.path.clone());
            }
            Err(source) => {
                tracing::warn!("Couldn't write {}: {source}", write.path);
                applied.failed.insert(write.id.clone());
                applied.errors.push(WriteError::Write {
                    path: write.path.clone(),
                    source,
                });
            }
        }
    }

    for remove in &plan.removes {
        // The old path of a rename is only removed once the new one exists.
        if applied.failed.contains(&remove.id) {
            continue;
        }

        match remove_file(&root.join(&remove.path), root) {
            Ok(()) => {
                tracing::debug!("Removed {}", remove.path);
                applied.deleted.push(remove.path.clone());
            }
            Err(source) => {
                tracing::warn!("Couldn't remove {}: {source}", remove.path);
                applied.failed.insert(remove.id.clone());
                applied.errors.push(WriteError::Remove {
                    path: remove.path.clone(),
                    source,
                });
            }
        }
    }

    applied
}

/// Brings the baseline snapshot in line with this sync, leaving the entries
/// of failed ids alone.
pub(crate) fn update_snapshot(
    snapshot: &Snapshot,
    plan: &Plan,
    failed: &HashSet<String>,
    keep: &HashSet<&Utf8Path>,
) -> Vec<WriteError> {
    let mut errors = Vec::new();

    for write in &plan.snapshot_writes {
        if failed.contains(&write.id) {
            continue;
        }

        if let Err(source) = snapshot.write(&write.path, &write.contents) {
            errors.push(WriteError::Snapshot {
                path: write.path.clone(),
                source,
            });
        }
    }

    for path in &plan.snapshot_removes {
        if keep.contains(path.as_path()) {
            continue;
        }

        if let Err(source) = snapshot.remove(path) {
            errors.push(WriteError::Snapshot {
                path: path.clone(),
                source,
            });
        }
    }

    snapshot.prune();
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::plan::{Remove, Write};

    #[test]
    fn test_failed_rename_keeps_old_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        write_file(&root.join("old.txt"), b"old").unwrap();
        // A file where a directory is needed makes the write fail.
        write_file(&root.join("blocked"), b"").unwrap();

        let plan = Plan {
            writes: vec![Write {
                id: "a".into(),
                path: "blocked/new.txt".into(),
                contents: b"new".to_vec(),
            }],
            removes: vec![Remove {
                id: "a".into(),
                path: "old.txt".into(),
            }],
            ..Default::default()
        };

        let applied = apply(&root, &plan);

        assert!(applied.written.is_empty());
        assert!(applied.deleted.is_empty());
        assert!(applied.failed.contains("a"));
        assert_eq!(applied.errors.len(), 1);
        assert!(root.join("old.txt").exists());
    }
}
