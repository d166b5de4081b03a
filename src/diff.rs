//! Unified diffs: parsing, all-or-nothing application and review.
//!
//! Paths in `---`/`+++` headers have their first component stripped (the
//! `a/` and `b/` prefixes), `/dev/null` marks creations and deletions. A diff
//! is applied in memory first; nothing touches disk unless every hunk of every
//! file found its place.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::collaborators::{ApplyReport, PatchApplier, ReviewAgent, ReviewIssue, ReviewReport};
use crate::error::FlowError;
use crate::process::run_with_timeout;
use crate::scanner::is_ignored_dir;
use crate::workspace::{ProjectPaths, relative_path};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed diff at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("diff contains no file changes")]
    Empty,

    #[error("refusing to touch path outside the project: {0}")]
    UnsafePath(String),

    #[error("{0}: file does not exist")]
    MissingFile(String),

    #[error("{0}: file already exists")]
    FileExists(String),

    #[error("{path}: hunk #{hunk} does not apply (expected at line {line})")]
    HunkFailed {
        path: String,
        hunk: usize,
        line: usize,
    },

    #[error("{0}: file still has content after deletion patch")]
    NotEmptied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DiffError> for FlowError {
    fn from(err: DiffError) -> Self {
        match err {
            DiffError::Io(e) => FlowError::Io(e),
            other => FlowError::ApplyConflict(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<Line>,
    old_no_eol: bool,
    new_no_eol: bool,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Context(s) | Line::Remove(s) => Some(s.as_str()),
                Line::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Context(s) | Line::Add(s) => Some(s.as_str()),
                Line::Remove(_) => None,
            })
            .collect()
    }

    /// Added lines with their line numbers in the new file.
    pub fn added(&self) -> Vec<(usize, &str)> {
        let mut line_no = self.new_start;
        let mut added = Vec::new();
        for line in &self.lines {
            match line {
                Line::Context(_) => line_no += 1,
                Line::Add(s) => {
                    added.push((line_no, s.as_str()));
                    line_no += 1;
                }
                Line::Remove(_) => {}
            }
        }
        added
    }

    fn mark_no_eol(&mut self) {
        match self.lines.last() {
            Some(Line::Add(_)) => self.new_no_eol = true,
            Some(Line::Remove(_)) => self.old_no_eol = true,
            Some(Line::Context(_)) => {
                self.old_no_eol = true;
                self.new_no_eol = true;
            }
            None => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` for a file created by the diff.
    pub old_path: Option<String>,
    /// `None` for a file deleted by the diff.
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("/dev/null")
    }
}

static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

fn header_path(rest: &str) -> Option<String> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim();
    if raw == "/dev/null" {
        return None;
    }
    Some(match raw.split_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => raw.to_string(),
    })
}

fn malformed(line: usize, reason: &str) -> DiffError {
    DiffError::Malformed {
        line,
        reason: reason.to_string(),
    }
}

pub fn parse(diff: &str) -> Result<Vec<FilePatch>, DiffError> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut patches = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(old) = lines[i].strip_prefix("--- ") else {
            i += 1;
            continue;
        };
        let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")) else {
            return Err(malformed(i + 1, "`---` header without a `+++` header"));
        };
        let mut patch = FilePatch {
            old_path: header_path(old),
            new_path: header_path(new),
            hunks: Vec::new(),
        };
        if patch.old_path.is_none() && patch.new_path.is_none() {
            return Err(malformed(i + 1, "both sides are /dev/null"));
        }
        i += 2;
        while let Some(caps) = lines.get(i).and_then(|l| HUNK_HEADER.captures(l)) {
            let (hunk, next) = parse_hunk(&lines, i, &caps)?;
            patch.hunks.push(hunk);
            i = next;
        }
        if patch.hunks.is_empty() {
            return Err(malformed(i + 1, "file header without hunks"));
        }
        patches.push(patch);
    }

    if patches.is_empty() {
        return Err(DiffError::Empty);
    }
    Ok(patches)
}

fn parse_hunk(
    lines: &[&str],
    start: usize,
    caps: &regex::Captures<'_>,
) -> Result<(Hunk, usize), DiffError> {
    let number = |idx: usize| -> Result<usize, DiffError> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| malformed(start + 1, "line number out of range")),
            None => Ok(1),
        }
    };
    let mut hunk = Hunk {
        old_start: number(1)?,
        old_len: number(2)?,
        new_start: number(3)?,
        new_len: number(4)?,
        lines: Vec::new(),
        old_no_eol: false,
        new_no_eol: false,
    };

    let (mut old_left, mut new_left) = (hunk.old_len, hunk.new_len);
    let mut i = start + 1;
    while old_left > 0 || new_left > 0 {
        let Some(line) = lines.get(i) else {
            return Err(malformed(i + 1, "hunk ends early"));
        };
        match line.chars().next() {
            Some(' ') | None => {
                if old_left == 0 || new_left == 0 {
                    return Err(malformed(i + 1, "more context lines than the header says"));
                }
                hunk.lines.push(Line::Context(line.get(1..).unwrap_or("").to_string()));
                old_left -= 1;
                new_left -= 1;
            }
            Some('-') => {
                if old_left == 0 {
                    return Err(malformed(i + 1, "more removed lines than the header says"));
                }
                hunk.lines.push(Line::Remove(line[1..].to_string()));
                old_left -= 1;
            }
            Some('+') => {
                if new_left == 0 {
                    return Err(malformed(i + 1, "more added lines than the header says"));
                }
                hunk.lines.push(Line::Add(line[1..].to_string()));
                new_left -= 1;
            }
            Some('\\') => hunk.mark_no_eol(),
            Some(_) => return Err(malformed(i + 1, "unexpected line inside hunk")),
        }
        i += 1;
    }
    if lines.get(i).is_some_and(|l| l.starts_with('\\')) {
        hunk.mark_no_eol();
        i += 1;
    }
    Ok((hunk, i))
}

/// File contents split into lines, remembering the final newline.
struct Text {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Text {
    fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let trailing_newline = s.ends_with('\n');
        let body = s.strip_suffix('\n').unwrap_or(s);
        Self {
            lines: body.split('\n').map(str::to_string).collect(),
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

/// Nearest position at or after `cursor` where `old` matches, searching
/// outwards from `expected`.
fn find_match(lines: &[String], old: &[&str], expected: usize, cursor: usize) -> Option<usize> {
    if old.len() > lines.len() {
        return None;
    }
    let last = lines.len() - old.len();
    let matches_at = |pos: usize| {
        pos >= cursor
            && pos <= last
            && old
                .iter()
                .enumerate()
                .all(|(k, l)| lines[pos + k].trim_end_matches('\r') == *l)
    };
    for offset in 0..=lines.len() {
        if matches_at(expected + offset) {
            return Some(expected + offset);
        }
        if offset > 0 && expected >= offset && matches_at(expected - offset) {
            return Some(expected - offset);
        }
    }
    None
}

fn patch_text(path: &str, base: &str, patch: &FilePatch) -> Result<String, DiffError> {
    let mut text = Text::parse(base);
    let mut delta: isize = 0;
    let mut cursor = 0;

    for (n, hunk) in patch.hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new = hunk.new_lines();
        // A zero-length old side names the line *after* which to insert.
        let anchor = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = (anchor as isize + delta).max(0) as usize;
        let pos = find_match(&text.lines, &old, expected, cursor).ok_or_else(|| {
            DiffError::HunkFailed {
                path: path.to_string(),
                hunk: n + 1,
                line: hunk.old_start,
            }
        })?;
        if pos != expected {
            let offset = pos as isize - expected as isize;
            debug!(path, hunk = n + 1, offset, "hunk applied with offset");
        }
        text.lines
            .splice(pos..pos + old.len(), new.iter().map(|s| s.to_string()));
        cursor = pos + new.len();
        delta += new.len() as isize - old.len() as isize;

        if hunk.new_no_eol {
            text.trailing_newline = false;
        } else if hunk.old_no_eol {
            text.trailing_newline = true;
        }
    }
    Ok(text.render())
}

fn checked(path: &str) -> Result<String, DiffError> {
    relative_path(path).ok_or_else(|| DiffError::UnsafePath(path.to_string()))
}

/// A planned filesystem change, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Write { path: String, contents: String },
    Delete { path: String },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Write { path, .. } | Change::Delete { path } => path,
        }
    }
}

fn read_current(
    root: &Path,
    overlay: &BTreeMap<String, Option<String>>,
    path: &str,
) -> Result<Option<String>, DiffError> {
    if let Some(current) = overlay.get(path) {
        return Ok(current.clone());
    }
    match std::fs::read_to_string(root.join(path)) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Works out every change the patches make to the tree under `root`
/// without writing anything.
pub fn plan(root: &Path, patches: &[FilePatch]) -> Result<Vec<Change>, DiffError> {
    let mut overlay: BTreeMap<String, Option<String>> = BTreeMap::new();

    for patch in patches {
        let source = patch.old_path.as_deref().map(checked).transpose()?;
        let target = patch.new_path.as_deref().map(checked).transpose()?;

        let base = match (&source, &target) {
            (Some(src), _) => read_current(root, &overlay, src)?
                .ok_or_else(|| DiffError::MissingFile(src.clone()))?,
            (None, Some(dst)) => {
                if read_current(root, &overlay, dst)?.is_some() {
                    return Err(DiffError::FileExists(dst.clone()));
                }
                String::new()
            }
            (None, None) => return Err(malformed(0, "both sides are /dev/null")),
        };
        let contents = patch_text(patch.path(), &base, patch)?;

        match (source, target) {
            (source, Some(dst)) => {
                if let Some(src) = source
                    && src != dst
                {
                    overlay.insert(src, None);
                }
                overlay.insert(dst, Some(contents));
            }
            (Some(src), None) => {
                if !contents.is_empty() {
                    return Err(DiffError::NotEmptied(src));
                }
                overlay.insert(src, None);
            }
            (None, None) => {}
        }
    }

    Ok(overlay
        .into_iter()
        .map(|(path, contents)| match contents {
            Some(contents) => Change::Write { path, contents },
            None => Change::Delete { path },
        })
        .collect())
}

/// Writes planned changes. Each file goes through a temporary file in its
/// own directory, which is removed again if the write fails.
pub fn commit(root: &Path, changes: &[Change]) -> Result<(), DiffError> {
    for change in changes {
        let dest = root.join(change.path());
        match change {
            Change::Write { contents, .. } => {
                let parent = dest.parent().unwrap_or(root);
                std::fs::create_dir_all(parent)?;
                let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                tmp.write_all(contents.as_bytes())?;
                tmp.flush()?;
                if let Ok(meta) = std::fs::metadata(&dest) {
                    tmp.as_file().set_permissions(meta.permissions())?;
                }
                tmp.persist(&dest).map_err(|e| e.error)?;
            }
            Change::Delete { .. } => match std::fs::remove_file(&dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
    }
    Ok(())
}

/// Parses, plans and commits `diff` against `root`. Returns the touched paths.
pub fn apply_diff(root: &Path, diff: &str) -> Result<Vec<String>, DiffError> {
    let patches = parse(diff)?;
    let changes = plan(root, &patches)?;
    commit(root, &changes)?;
    Ok(changes.iter().map(|c| c.path().to_string()).collect())
}

const MAX_LINE_LEN: usize = 120;

static DEBUG_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bdbg!\(|console\.log\(|pdb\.set_trace\(|\bbreakpoint\(\)").unwrap()
});
static MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(TODO|FIXME|XXX)\b").unwrap());

/// Style warnings for the lines a diff adds.
pub fn lint(patches: &[FilePatch]) -> Vec<String> {
    let mut warnings = Vec::new();
    for patch in patches {
        let path = patch.path();
        for hunk in &patch.hunks {
            for (line_no, line) in hunk.added() {
                if line != line.trim_end() {
                    warnings.push(format!("{path}:{line_no}: trailing whitespace"));
                }
                if line.chars().count() > MAX_LINE_LEN {
                    warnings.push(format!(
                        "{path}:{line_no}: line longer than {MAX_LINE_LEN} characters"
                    ));
                }
                if DEBUG_OUTPUT.is_match(line) {
                    warnings.push(format!("{path}:{line_no}: leftover debug output"));
                }
                if let Some(m) = MARKER.find(line) {
                    warnings.push(format!("{path}:{line_no}: {} marker added", m.as_str()));
                }
            }
        }
    }
    warnings
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), DiffError> {
    let walker = WalkDir::new(src).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir() && is_ignored_dir(&e.file_name().to_string_lossy()))
    });
    for entry in walker {
        let entry = entry.map_err(|e| DiffError::Io(std::io::Error::other(e)))?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Reviews a diff against the live project without modifying it.
pub struct DiffReviewer {
    paths: ProjectPaths,
    test_command: Option<Vec<String>>,
    test_timeout: Duration,
}

impl DiffReviewer {
    pub fn new(paths: ProjectPaths) -> Self {
        Self {
            paths,
            test_command: None,
            test_timeout: Duration::from_secs(300),
        }
    }

    /// Also runs `command` against a patched copy of the project.
    pub fn with_tests(mut self, command: Vec<String>, timeout: Duration) -> Self {
        self.test_command = Some(command);
        self.test_timeout = timeout;
        self
    }

    async fn run_tests(
        &self,
        root: PathBuf,
        changes: Vec<Change>,
        command: &[String],
    ) -> Result<Option<ReviewIssue>, FlowError> {
        let scratch = tokio::task::spawn_blocking(move || -> Result<TempDir, DiffError> {
            let scratch = TempDir::new()?;
            copy_tree(&root, scratch.path())?;
            commit(scratch.path(), &changes)?;
            Ok(scratch)
        })
        .await
        .map_err(|e| FlowError::collaborator("Review preparation aborted", e))??;

        match run_with_timeout(command, scratch.path(), self.test_timeout).await {
            Ok(output) if output.success() => Ok(None),
            Ok(output) => Ok(Some(ReviewIssue {
                file: None,
                message: format!(
                    "Tests failed with the patch applied (exit code {}):\n{}",
                    output.code.map_or("none".to_string(), |c| c.to_string()),
                    output.combined()
                ),
            })),
            Err(FlowError::Timeout(message)) => Ok(Some(ReviewIssue {
                file: None,
                message,
            })),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ReviewAgent for DiffReviewer {
    async fn review(
        &self,
        user_id: &str,
        project_id: &str,
        diff: &str,
    ) -> Result<ReviewReport, FlowError> {
        let root = self.paths.resolve(user_id, project_id)?;

        let patches = match parse(diff) {
            Ok(patches) => patches,
            Err(e) => {
                warn!(project_id, "diff failed to parse: {e}");
                return Ok(ReviewReport {
                    success: false,
                    warnings: Vec::new(),
                    issues: vec![ReviewIssue {
                        file: None,
                        message: e.to_string(),
                    }],
                    error: Some("patch could not be parsed".into()),
                });
            }
        };

        let mut report = ReviewReport {
            warnings: lint(&patches),
            ..Default::default()
        };

        let planned = {
            let root = root.clone();
            let patches = patches.clone();
            tokio::task::spawn_blocking(move || plan(&root, &patches))
                .await
                .map_err(|e| FlowError::collaborator("Review aborted", e))?
        };
        match planned {
            Ok(changes) => {
                if let Some(command) = &self.test_command
                    && let Some(issue) = self.run_tests(root, changes, command).await?
                {
                    report.issues.push(issue);
                }
            }
            Err(DiffError::Io(e)) => return Err(e.into()),
            Err(e) => {
                let file = match &e {
                    DiffError::HunkFailed { path, .. } => Some(path.clone()),
                    DiffError::MissingFile(path)
                    | DiffError::FileExists(path)
                    | DiffError::NotEmptied(path)
                    | DiffError::UnsafePath(path) => Some(path.clone()),
                    _ => None,
                };
                report.issues.push(ReviewIssue {
                    file,
                    message: e.to_string(),
                });
            }
        }

        report.success = report.issues.is_empty();
        info!(
            project_id,
            success = report.success,
            warnings = report.warnings.len(),
            issues = report.issues.len(),
            "review finished"
        );
        Ok(report)
    }
}

/// Applies approved diffs to the live project tree.
pub struct WorkspacePatchApplier {
    paths: ProjectPaths,
}

impl WorkspacePatchApplier {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl PatchApplier for WorkspacePatchApplier {
    async fn apply(
        &self,
        user_id: &str,
        project_id: &str,
        diff: &str,
    ) -> Result<ApplyReport, FlowError> {
        let root = self.paths.resolve(user_id, project_id)?;
        let diff = diff.to_string();
        let applied = tokio::task::spawn_blocking(move || apply_diff(&root, &diff))
            .await
            .map_err(|e| FlowError::collaborator("Patch application aborted", e))?;
        match applied {
            Ok(files) => {
                info!(project_id, files = files.len(), "patch applied");
                Ok(ApplyReport::applied())
            }
            Err(DiffError::Io(e)) => Err(e.into()),
            Err(e) => {
                warn!(project_id, "patch rejected: {e}");
                Ok(ApplyReport::rejected(format!(
                    "Failed to apply patch. The patch may be invalid or rejected.\n{e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "import os\n\ndef main():\n    print('hi')\n\nmain()\n";

    const DIFF: &str = "\
diff --git a/app.py b/app.py
--- a/app.py
+++ b/app.py
@@ -1,4 +1,6 @@
 import os
+import logging

 def main():
+    logging.info('starting')
     print('hi')
--- /dev/null
+++ b/docs/NOTES.md
@@ -0,0 +1,2 @@
+# Notes
+Logging added.
";

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, contents) in files {
            let full = tmp.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        tmp
    }

    fn read(tmp: &TempDir, path: &str) -> String {
        std::fs::read_to_string(tmp.path().join(path)).unwrap()
    }

    #[test]
    fn parses_multi_file_diff_with_creation() {
        let patches = parse(DIFF).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].old_path.as_deref(), Some("app.py"));
        assert_eq!(patches[0].hunks[0].lines.len(), 6);
        assert_eq!(patches[1].old_path, None);
        assert_eq!(patches[1].path(), "docs/NOTES.md");
        assert_eq!(
            patches[0].hunks[0].added(),
            vec![(2, "import logging"), (5, "    logging.info('starting')")]
        );
    }

    #[test]
    fn rejects_garbage_and_short_hunks() {
        assert!(matches!(parse("no diff here"), Err(DiffError::Empty)));
        assert!(matches!(
            parse("Error: model unavailable"),
            Err(DiffError::Empty)
        ));
        let short = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n-b\n";
        assert!(matches!(parse(short), Err(DiffError::Malformed { .. })));
    }

    #[test]
    fn applies_atomically_across_files() {
        let tmp = tree(&[("app.py", BASE)]);
        let touched = apply_diff(tmp.path(), DIFF).unwrap();
        assert_eq!(touched, vec!["app.py", "docs/NOTES.md"]);
        assert_eq!(
            read(&tmp, "app.py"),
            "import os\nimport logging\n\ndef main():\n    logging.info('starting')\n    print('hi')\n\nmain()\n"
        );
        assert_eq!(read(&tmp, "docs/NOTES.md"), "# Notes\nLogging added.\n");
    }

    #[test]
    fn conflict_in_one_file_writes_nothing() {
        let diff = format!(
            "{DIFF}--- a/other.py\n+++ b/other.py\n@@ -1,1 +1,1 @@\n-absent line\n+replacement\n"
        );
        let tmp = tree(&[("app.py", BASE), ("other.py", "something else\n")]);
        let err = apply_diff(tmp.path(), &diff).unwrap_err();
        assert!(matches!(err, DiffError::HunkFailed { hunk: 1, .. }));
        assert_eq!(read(&tmp, "app.py"), BASE);
        assert!(!tmp.path().join("docs").exists());

        // No temporary files left behind.
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn hunk_found_at_offset() {
        let shifted = format!("# header\n# more\n{BASE}");
        let tmp = tree(&[("app.py", &shifted)]);
        let diff = "--- a/app.py\n+++ b/app.py\n@@ -3,2 +3,2 @@\n def main():\n-    print('hi')\n+    print('hello')\n";
        apply_diff(tmp.path(), diff).unwrap();
        assert!(read(&tmp, "app.py").contains("    print('hello')\n"));
    }

    #[test]
    fn deletion_and_missing_newline() {
        let tmp = tree(&[("gone.txt", "a\nb\n"), ("tail.txt", "x\ny")]);
        let diff = "\
--- a/gone.txt
+++ /dev/null
@@ -1,2 +0,0 @@
-a
-b
--- a/tail.txt
+++ b/tail.txt
@@ -1,2 +1,2 @@
 x
-y
\\ No newline at end of file
+z
";
        apply_diff(tmp.path(), diff).unwrap();
        assert!(!tmp.path().join("gone.txt").exists());
        assert_eq!(read(&tmp, "tail.txt"), "x\nz\n");
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let tmp = tree(&[]);
        let diff = "--- /dev/null\n+++ b/../../etc/evil\n@@ -0,0 +1 @@\n+x\n";
        assert!(matches!(
            apply_diff(tmp.path(), diff),
            Err(DiffError::UnsafePath(_))
        ));
    }

    #[test]
    fn creating_an_existing_file_conflicts() {
        let tmp = tree(&[("docs/NOTES.md", "old\n"), ("app.py", BASE)]);
        let err = apply_diff(tmp.path(), DIFF).unwrap_err();
        assert!(matches!(err, DiffError::FileExists(_)));
        assert_eq!(FlowError::from(err).kind(), crate::state_machine::FailureKind::ApplyConflict);
    }

    /// Removed and added lines between two texts, via longest common subsequence.
    fn line_changes(before: &str, after: &str) -> (Vec<String>, Vec<String>) {
        let a: Vec<&str> = before.lines().collect();
        let b: Vec<&str> = after.lines().collect();
        let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
        for i in (0..a.len()).rev() {
            for j in (0..b.len()).rev() {
                lcs[i][j] = if a[i] == b[j] {
                    lcs[i + 1][j + 1] + 1
                } else {
                    lcs[i + 1][j].max(lcs[i][j + 1])
                };
            }
        }
        let (mut i, mut j) = (0, 0);
        let (mut removed, mut added) = (Vec::new(), Vec::new());
        while i < a.len() || j < b.len() {
            if i < a.len() && j < b.len() && a[i] == b[j] {
                i += 1;
                j += 1;
            } else if j < b.len() && (i == a.len() || lcs[i][j + 1] >= lcs[i + 1][j]) {
                added.push(b[j].to_string());
                j += 1;
            } else {
                removed.push(a[i].to_string());
                i += 1;
            }
        }
        (removed, added)
    }

    #[test]
    fn applied_tree_reproduces_the_diff_line_changes() {
        let base = "one\ntwo\nthree\nfour\nfive\n";
        let diff = "--- a/f.txt\n+++ b/f.txt\n@@ -1,5 +1,6 @@\n one\n-two\n+TWO\n three\n four\n-five\n+five!\n+six\n";
        let tmp = tree(&[("f.txt", base)]);
        apply_diff(tmp.path(), diff).unwrap();

        let patches = parse(diff).unwrap();
        let mut expected_removed = Vec::new();
        let mut expected_added = Vec::new();
        for line in &patches[0].hunks[0].lines {
            match line {
                Line::Remove(s) => expected_removed.push(s.clone()),
                Line::Add(s) => expected_added.push(s.clone()),
                Line::Context(_) => {}
            }
        }
        let (removed, added) = line_changes(base, &read(&tmp, "f.txt"));
        assert_eq!(removed, expected_removed);
        assert_eq!(added, expected_added);
    }

    #[test]
    fn lint_flags_added_lines_only() {
        let diff = "--- a/x.py\n+++ b/x.py\n@@ -1,1 +1,3 @@\n keep  \n+value = 1   \n+breakpoint()  # TODO remove\n";
        let warnings = lint(&parse(diff).unwrap());
        assert_eq!(
            warnings,
            vec![
                "x.py:2: trailing whitespace",
                "x.py:3: leftover debug output",
                "x.py:3: TODO marker added",
            ]
        );
    }

    const USER: &str = "6f1c5a4e-93a1-4a55-8a4b-1d2f3e4a5b6c";
    const PROJECT: &str = "0b7d9c1e-2f3a-4b5c-8d6e-7f8091a2b3c4";

    fn workspace(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join(USER).join(PROJECT);
        for (path, contents) in files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        std::fs::create_dir_all(&root).unwrap();
        (tmp, root)
    }

    #[tokio::test]
    async fn reviewer_reports_conflicts_without_touching_project() {
        let (tmp, root) = workspace(&[("app.py", "unrelated\n")]);
        let reviewer = DiffReviewer::new(ProjectPaths::new(tmp.path()));
        let report = reviewer.review(USER, PROJECT, DIFF).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.issues[0].file.as_deref(), Some("app.py"));
        assert_eq!(std::fs::read_to_string(root.join("app.py")).unwrap(), "unrelated\n");
    }

    #[tokio::test]
    async fn reviewer_runs_tests_on_a_patched_copy() {
        let (tmp, root) = workspace(&[("app.py", BASE)]);
        let reviewer = DiffReviewer::new(ProjectPaths::new(tmp.path())).with_tests(
            vec!["sh".into(), "-c".into(), "grep -q logging app.py".into()],
            Duration::from_secs(10),
        );
        let report = reviewer.review(USER, PROJECT, DIFF).await.unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(std::fs::read_to_string(root.join("app.py")).unwrap(), BASE);

        let failing = DiffReviewer::new(ProjectPaths::new(tmp.path())).with_tests(
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 1".into()],
            Duration::from_secs(10),
        );
        let report = failing.review(USER, PROJECT, DIFF).await.unwrap();
        assert!(!report.success);
        assert!(report.issues[0].message.contains("boom"));
    }

    #[tokio::test]
    async fn reviewer_fails_for_unknown_project() {
        let tmp = TempDir::new().unwrap();
        let reviewer = DiffReviewer::new(ProjectPaths::new(tmp.path()));
        assert!(reviewer.review(USER, PROJECT, DIFF).await.is_err());
    }

    #[tokio::test]
    async fn applier_reports_rejection_with_detail() {
        let (tmp, root) = workspace(&[("app.py", BASE)]);
        let applier = WorkspacePatchApplier::new(ProjectPaths::new(tmp.path()));

        let report = applier.apply(USER, PROJECT, DIFF).await.unwrap();
        assert_eq!(report, ApplyReport::applied());
        assert!(root.join("docs/NOTES.md").exists());

        // Applying the same diff twice no longer matches the tree.
        let report = applier.apply(USER, PROJECT, DIFF).await.unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().starts_with("Failed to apply patch"));
    }
}
