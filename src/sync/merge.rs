//! Line-based three-way merge.
//!
//! The merge follows diff3: lines of the base matched in both sides split
//! the inputs into stable chunks, where nobody changed anything, and
//! unstable chunks in between. An unstable chunk changed by one side only
//! takes that side; a chunk changed identically on both sides is taken once;
//! anything else becomes a conflict.

use serde::{Deserialize, Serialize};

use crate::sync::diff;

/// Labels written after the opening and closing conflict markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictLabels {
    pub existing: String,
    pub generated: String,
}

impl Default for ConflictLabels {
    fn default() -> Self {
        Self {
            existing: "existing".into(),
            generated: "generated".into(),
        }
    }
}

/// The result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub contents: String,
    pub has_conflict: bool,
}

enum Chunk<'a> {
    Stable(&'a [&'a str]),
    Unstable {
        base: &'a [&'a str],
        existing: &'a [&'a str],
        generated: &'a [&'a str],
    },
}

/// Merges the changes from `base` to `existing` and from `base` to
/// `generated`.
///
/// Overlapping changes that disagree are wrapped in conflict markers:
///
/// ```text
/// <<<<<<< existing
/// the user's lines
/// =======
/// the generated lines
/// >>>>>>> generated
/// ```
pub fn merge_text(
    base: &str,
    existing: &str,
    generated: &str,
    labels: &ConflictLabels,
) -> MergeResult {
    if existing == generated || base == generated {
        return clean(existing);
    }
    if base == existing {
        return clean(generated);
    }

    let base: Vec<&str> = base.split_inclusive('\n').collect();
    let existing: Vec<&str> = existing.split_inclusive('\n').collect();
    let generated: Vec<&str> = generated.split_inclusive('\n').collect();

    let mut contents = String::new();
    let mut has_conflict = false;

    for chunk in chunks(&base, &existing, &generated) {
        match chunk {
            Chunk::Stable(lines) => contents.extend(lines.iter().copied()),
            Chunk::Unstable {
                base,
                existing,
                generated,
            } => {
                if existing == base {
                    contents.extend(generated.iter().copied());
                } else if generated == base || existing == generated {
                    contents.extend(existing.iter().copied());
                } else {
                    has_conflict = true;
                    write_conflict(&mut contents, existing, generated, labels);
                }
            }
        }
    }

    MergeResult {
        contents,
        has_conflict,
    }
}

fn clean(contents: &str) -> MergeResult {
    MergeResult {
        contents: contents.to_string(),
        has_conflict: false,
    }
}

/// Splits the three inputs into stable and unstable chunks.
fn chunks<'a>(
    base: &'a [&'a str],
    existing: &'a [&'a str],
    generated: &'a [&'a str],
) -> Vec<Chunk<'a>> {
    let mut in_existing = vec![None; base.len()];
    for (o, a) in diff::matches(base, existing) {
        in_existing[o] = Some(a);
    }

    let mut in_generated = vec![None; base.len()];
    for (o, b) in diff::matches(base, generated) {
        in_generated[o] = Some(b);
    }

    let mut chunks = Vec::new();
    let (mut o, mut a, mut b) = (0, 0, 0);

    loop {
        let mut run = 0;
        while o + run < base.len()
            && in_existing[o + run] == Some(a + run)
            && in_generated[o + run] == Some(b + run)
        {
            run += 1;
        }

        if run > 0 {
            chunks.push(Chunk::Stable(&base[o..o + run]));
            o += run;
            a += run;
            b += run;
            continue;
        }

        let sync = (o..base.len()).find(|&i| in_existing[i].is_some() && in_generated[i].is_some());

        let (next_o, next_a, next_b) = match sync {
            Some(i) => (i, in_existing[i].unwrap_or(a), in_generated[i].unwrap_or(b)),
            None => (base.len(), existing.len(), generated.len()),
        };

        if next_o > o || next_a > a || next_b > b {
            chunks.push(Chunk::Unstable {
                base: &base[o..next_o],
                existing: &existing[a..next_a],
                generated: &generated[b..next_b],
            });
        }

        if sync.is_none() {
            break;
        }

        o = next_o;
        a = next_a;
        b = next_b;
    }

    chunks
}

/// Writes a conflict, keeping lines both sides agree on at its edges
/// outside the markers.
fn write_conflict(out: &mut String, existing: &[&str], generated: &[&str], labels: &ConflictLabels) {
    let head = existing
        .iter()
        .zip(generated)
        .take_while(|(x, y)| x == y)
        .count();

    let tail = existing[head..]
        .iter()
        .rev()
        .zip(generated[head..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    out.extend(existing[..head].iter().copied());

    out.push_str("<<<<<<< ");
    out.push_str(&labels.existing);
    out.push('\n');
    push_lines(out, &existing[head..existing.len() - tail]);
    out.push_str("=======\n");
    push_lines(out, &generated[head..generated.len() - tail]);
    out.push_str(">>>>>>> ");
    out.push_str(&labels.generated);
    out.push('\n');

    out.extend(existing[existing.len() - tail..].iter().copied());
}

/// Pushes lines, terminating an unterminated last line so the marker after
/// it starts on its own line.
fn push_lines(out: &mut String, lines: &[&str]) {
    for line in lines {
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push('\n');
        }
    }
}

/// Whether the merge should treat `bytes` as binary.
pub(crate) fn is_binary(bytes: &[u8]) -> bool {
    bytes.contains(&0) || std::str::from_utf8(bytes).is_err()
}
