//! Formatting applied to generated text before it is merged.
//!
//! Formatting happens before the three-way merge so a formatter pass never
//! shows up as a difference between the baseline and the new output.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use camino::Utf8Path;
use rayon::prelude::*;

use crate::error::SyncError;
use crate::output::{FileContents, FileEntry, GeneratorOutput};

/// A formatter for one or more file extensions.
pub trait Formatter: Send + Sync {
    fn name(&self) -> &str;

    /// Extensions handled by this formatter, without the leading dot.
    fn extensions(&self) -> &[&str];

    fn format(&self, path: &Utf8Path, contents: &str) -> anyhow::Result<String>;
}

/// Re-serializes JSON with two-space indentation, keeping key order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn name(&self) -> &str {
        "json"
    }

    fn extensions(&self) -> &[&str] {
        &["json"]
    }

    fn format(&self, _: &Utf8Path, contents: &str) -> anyhow::Result<String> {
        let value: serde_json::Value = serde_json::from_str(contents)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

/// The formatters of a sync, one per extension.
#[derive(Clone, Default)]
pub struct FormatterSet {
    by_extension: BTreeMap<String, Arc<dyn Formatter>>,
}

impl FormatterSet {
    /// A set without any extension formatters. Line endings are still
    /// normalized.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in formatters.
    pub fn standard() -> Self {
        Self::new().with(JsonFormatter)
    }

    /// Registers `formatter` for all of its extensions, replacing whatever
    /// was registered for them before.
    pub fn register(&mut self, formatter: impl Formatter + 'static) -> &mut Self {
        let formatter: Arc<dyn Formatter> = Arc::new(formatter);
        for extension in formatter.extensions() {
            self.by_extension
                .insert(extension.to_string(), formatter.clone());
        }
        self
    }

    pub fn with(mut self, formatter: impl Formatter + 'static) -> Self {
        self.register(formatter);
        self
    }

    pub fn get(&self, extension: &str) -> Option<&dyn Formatter> {
        self.by_extension.get(extension).map(|formatter| formatter.as_ref())
    }

    /// Formats every text entry of `output` in place. Entries are grouped by
    /// extension and the groups are processed in parallel.
    pub(crate) fn apply(&self, output: &mut GeneratorOutput) -> Result<(), SyncError> {
        let mut groups: BTreeMap<&str, Vec<&mut FileEntry>> = BTreeMap::new();

        for (path, entry) in output.files.iter_mut() {
            if entry.options.skip_formatting {
                continue;
            }
            if let FileContents::Utf8(_) = entry.contents {
                groups
                    .entry(path.extension().unwrap_or_default())
                    .or_default()
                    .push(entry);
            }
        }

        let results: Vec<Result<(), SyncError>> = groups
            .into_par_iter()
            .map(|(extension, entries)| -> Result<(), SyncError> {
                let formatter = self.get(extension);
                for entry in entries {
                    format_entry(formatter, entry)?;
                }
                Ok(())
            })
            .collect();

        results.into_iter().collect()
    }
}

fn format_entry(formatter: Option<&dyn Formatter>, entry: &mut FileEntry) -> Result<(), SyncError> {
    let FileContents::Utf8(text) = &entry.contents else {
        return Ok(());
    };

    let text = match formatter {
        Some(formatter) => {
            tracing::debug!("Formatting {} with {}", entry.path, formatter.name());
            formatter
                .format(&entry.path, text)
                .map_err(|source| SyncError::Format {
                    formatter: formatter.name().to_string(),
                    path: entry.path.clone(),
                    source,
                })?
        }
        None => text.clone(),
    };

    entry.contents = FileContents::Utf8(normalize_line_endings(&text));
    Ok(())
}

impl Debug for FormatterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.by_extension
                    .iter()
                    .map(|(extension, formatter)| (extension, formatter.name())),
            )
            .finish()
    }
}

/// Converts CRLF and lone CR to LF and ends non-empty text with exactly one
/// newline.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n").replace('\r', "\n");

    let trimmed = out.trim_end_matches('\n').len();
    out.truncate(trimmed);

    if !out.is_empty() {
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    struct Upper;

    impl Formatter for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn extensions(&self) -> &[&str] {
            &["txt", "json"]
        }

        fn format(&self, _: &Utf8Path, contents: &str) -> anyhow::Result<String> {
            Ok(contents.to_uppercase())
        }
    }

    fn output(entries: Vec<FileEntry>) -> GeneratorOutput {
        GeneratorOutput {
            files: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
            commands: vec![],
        }
    }

    fn text<'a>(output: &'a GeneratorOutput, path: &str) -> &'a str {
        output.files[&Utf8PathBuf::from(path)]
            .contents
            .as_text()
            .unwrap()
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings("a\r\nb\r\n\r\n\n"), "a\nb\n");
        assert_eq!(normalize_line_endings("a"), "a\n");
        assert_eq!(normalize_line_endings(""), "");
    }

    #[test]
    fn test_json_pretty_keeps_key_order() {
        let formatted = JsonFormatter
            .format(Utf8Path::new("a.json"), r#"{"b":1,"a":[true]}"#)
            .unwrap();

        assert_eq!(formatted, "{\n  \"b\": 1,\n  \"a\": [\n    true\n  ]\n}");
    }

    #[test]
    fn test_apply_groups_and_skips() {
        let mut out = output(vec![
            FileEntry::text("a", "a.txt", "hello\r\n"),
            FileEntry::text("b", "b.txt", "raw\r\n").skip_formatting(),
            FileEntry::text("c", "c.rs", "fn main() {}"),
            FileEntry::binary("d", "d.txt", vec![0, 1, 2]),
        ]);

        FormatterSet::new().with(Upper).apply(&mut out).unwrap();

        assert_eq!(text(&out, "a.txt"), "HELLO\n");
        assert_eq!(text(&out, "b.txt"), "raw\r\n");
        assert_eq!(text(&out, "c.rs"), "fn main() {}\n");
        assert_eq!(out.files[&Utf8PathBuf::from("d.txt")].contents.as_bytes(), &[0, 1, 2]);
    }

    #[test]
    fn test_later_registration_replaces() {
        let set = FormatterSet::standard().with(Upper);

        assert_eq!(set.get("json").map(|f| f.name()), Some("upper"));
        assert_eq!(set.get("txt").map(|f| f.name()), Some("upper"));
    }

    #[test]
    fn test_format_error_names_formatter() {
        let mut out = output(vec![FileEntry::text("a", "broken.json", "{")]);

        let err = FormatterSet::standard().apply(&mut out).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Format { ref formatter, ref path, .. } if formatter == "json" && path == "broken.json"
        ));
    }
}
