use std::collections::HashSet;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::output::PostWriteCommand;

const GLOB_OPTS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// How a post-write command went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub working_directory: Utf8PathBuf,
    /// Exit code, if the process ran to completion.
    pub status: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Set when the process couldn't be started at all.
    pub error: Option<String>,
}

/// Picks the commands to run after a sync that modified `modified`, in the
/// order they should run.
pub(crate) fn select<'a>(
    commands: &'a [PostWriteCommand],
    modified: &[Utf8PathBuf],
    rerun: &[String],
) -> Vec<&'a PostWriteCommand> {
    let mut seen = HashSet::new();
    let mut selected: Vec<_> = commands
        .iter()
        .filter(|cmd| seen.insert((cmd.command.as_str(), cmd.working_directory.as_deref())))
        .filter(|cmd| should_run(cmd, modified, rerun))
        .collect();

    // Stable, so equal priorities keep their order.
    selected.sort_by_key(|cmd| cmd.priority);
    selected
}

fn should_run(command: &PostWriteCommand, modified: &[Utf8PathBuf], rerun: &[String]) -> bool {
    let Some(patterns) = &command.only_if_changed else {
        return true;
    };

    if rerun.contains(&command.command) {
        return true;
    }

    patterns.iter().any(|pattern| match Pattern::new(pattern) {
        Ok(matcher) => modified
            .iter()
            .any(|path| matcher.matches_with(path.as_str(), GLOB_OPTS)),
        Err(e) => {
            tracing::warn!("Invalid pattern '{pattern}' in '{}': {e}", command.command);
            modified.iter().any(|path| path.as_str() == pattern)
        }
    })
}

/// Runs a command through the platform shell.
pub(crate) fn execute(root: &Utf8Path, command: &PostWriteCommand) -> CommandOutcome {
    let working_directory = match &command.working_directory {
        Some(dir) => root.join(dir),
        None => root.to_owned(),
    };

    let mut shell = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C");
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c");
        cmd
    };

    tracing::info!("Running `{}`", command.command);

    let output = shell
        .arg(&command.command)
        .current_dir(&working_directory)
        .output();

    let outcome = match output {
        Ok(output) => CommandOutcome {
            command: command.command.clone(),
            working_directory,
            status: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        },
        Err(e) => CommandOutcome {
            command: command.command.clone(),
            working_directory,
            status: None,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(e.to_string()),
        },
    };

    if !outcome.success {
        tracing::warn!(
            "Command `{}` failed: {}",
            outcome.command,
            outcome
                .error
                .as_deref()
                .unwrap_or_else(|| outcome.stderr.trim())
        );
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(selected: Vec<&PostWriteCommand>) -> Vec<&str> {
        selected.into_iter().map(|cmd| cmd.command.as_str()).collect()
    }

    #[test]
    fn test_conditions() {
        let commands = vec![
            PostWriteCommand::new("always"),
            PostWriteCommand::new("rust").only_if_changed(["src/**/*.rs"]),
            PostWriteCommand::new("docs").only_if_changed(["docs/*.md"]),
        ];
        let modified = vec![Utf8PathBuf::from("src/engine/mod.rs")];

        assert_eq!(names(select(&commands, &modified, &[])), ["always", "rust"]);
        assert_eq!(
            names(select(&commands, &[], &["docs".into()])),
            ["always", "docs"]
        );
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let commands = vec![PostWriteCommand::new("top").only_if_changed(["*.md"])];

        assert!(select(&commands, &["docs/a.md".into()], &[]).is_empty());
        assert_eq!(select(&commands, &["a.md".into()], &[]).len(), 1);
    }

    #[test]
    fn test_dedup_and_priority() {
        let commands = vec![
            PostWriteCommand::new("b").priority(5),
            PostWriteCommand::new("a"),
            PostWriteCommand::new("b").priority(-1),
            PostWriteCommand::new("b").working_directory("sub").priority(5),
            PostWriteCommand::new("c").priority(-2),
        ];

        let selected = select(&commands, &[], &[]);
        let order: Vec<_> = selected
            .iter()
            .map(|cmd| (cmd.command.as_str(), cmd.working_directory.is_some()))
            .collect();

        assert_eq!(order, [("c", false), ("a", false), ("b", false), ("b", true)]);
    }

    #[test]
    fn test_invalid_pattern_is_literal() {
        let commands = vec![PostWriteCommand::new("x").only_if_changed(["a[.txt"])];

        assert_eq!(select(&commands, &["a[.txt".into()], &[]).len(), 1);
        assert!(select(&commands, &["b.txt".into()], &[]).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let ok = execute(&root, &PostWriteCommand::new("echo hi"));
        assert!(ok.success);
        assert_eq!(ok.stdout, "hi\n");

        let failed = execute(&root, &PostWriteCommand::new("exit 3"));
        assert!(!failed.success);
        assert_eq!(failed.status, Some(3));
    }
}
