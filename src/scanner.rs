//! Static architecture scanner.
//!
//! Produces a per-file summary of imports, function signatures and
//! class-like items for Python and Rust sources. Files that cannot be read are
//! recorded with an `error` entry instead of failing the scan.
//!
//! Summaries are line-based, not a full parse. Python files with unbalanced
//! brackets or unterminated strings are recorded as errors; other syntax
//! errors, including bad indentation, still produce a summary. Rust files are
//! never syntax-checked.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Directories never worth scanning or sending to a model.
pub const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSig {
    pub name: String,
    pub args: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub name: String,
    pub methods: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub functions: Vec<FunctionSig>,
    #[serde(default)]
    pub classes: Vec<ClassSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Relative path (with `/` separators) to summary, in path order.
pub type ArchitectureMap = BTreeMap<String, FileSummary>;

#[derive(Clone, Copy)]
enum Language {
    Python,
    Rust,
}

impl Language {
    fn of(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => Some(Language::Python),
            Some("rs") => Some(Language::Rust),
            _ => None,
        }
    }
}

pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

/// `path` relative to `root` with `/` separators on every platform.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Walks `root` and summarises every supported source file.
pub fn scan_repository(root: &Path) -> ArchitectureMap {
    let mut map = ArchitectureMap::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && is_ignored_dir(&e.file_name().to_string_lossy()))
        });

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(lang) = Language::of(entry.path()) else {
            continue;
        };
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };

        let summary = match std::fs::read(entry.path()).map(String::from_utf8) {
            Ok(Ok(source)) => match lang {
                Language::Python => match python_syntax_error(&source) {
                    Some(err) => unparsable(&key, err),
                    None => scan_python(&source),
                },
                Language::Rust => scan_rust(&source),
            },
            Ok(Err(e)) => unparsable(&key, e),
            Err(e) => unparsable(&key, e),
        };
        map.insert(key, summary);
    }

    info!(root = %root.display(), files = map.len(), "architecture scan finished");
    map
}

fn unparsable(key: &str, err: impl std::fmt::Display) -> FileSummary {
    warn!(file = key, "could not parse file: {err}");
    FileSummary {
        error: Some(format!("Could not parse file: {err}")),
        ..Default::default()
    }
}

static PY_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());
static PY_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+(\S+)\s+import\s+(.+)$").unwrap());
static PY_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)\s*\(([^)]*)").unwrap());
static PY_CLASS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\s*)class\s+(\w+)").unwrap());

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn split_names(list: &str) -> impl Iterator<Item = &str> {
    list.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(|part| part.split(" as ").next().unwrap_or(part).trim())
        .filter(|name| !name.is_empty())
}

fn python_args(args: &str) -> Vec<String> {
    args.split(',')
        .map(|a| {
            a.split([':', '='])
                .next()
                .unwrap_or(a)
                .trim()
                .trim_start_matches('*')
                .to_string()
        })
        .filter(|a| !a.is_empty() && a != "/")
        .collect()
}

/// Finds unbalanced brackets and unterminated strings outside comments.
fn python_syntax_error(source: &str) -> Option<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut open: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' => {
                while chars.get(i + 1).is_some_and(|n| *n != '\n') {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let start = line;
                let tripled =
                    |at: usize| chars.get(at + 1) == Some(&c) && chars.get(at + 2) == Some(&c);
                let triple = tripled(i);
                let quote_len = if triple { 3 } else { 1 };
                i += quote_len;
                loop {
                    match chars.get(i).copied() {
                        None => {
                            return Some(format!(
                                "SyntaxError: unterminated string literal (line {start})"
                            ));
                        }
                        Some('\\') => {
                            if chars.get(i + 1) == Some(&'\n') {
                                line += 1;
                            }
                            i += 2;
                            continue;
                        }
                        Some('\n') if !triple => {
                            return Some(format!(
                                "SyntaxError: unterminated string literal (line {start})"
                            ));
                        }
                        Some('\n') => line += 1,
                        Some(q) if q == c && (!triple || tripled(i)) => {
                            i += quote_len;
                            break;
                        }
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            '(' | '[' | '{' => open.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match open.pop() {
                    Some((o, _)) if o == expected => {}
                    Some((o, at)) => {
                        return Some(format!(
                            "SyntaxError: closing '{c}' on line {line} does not match '{o}' on line {at}"
                        ));
                    }
                    None => return Some(format!("SyntaxError: unmatched '{c}' on line {line}")),
                }
            }
            _ => {}
        }
        i += 1;
    }
    open.pop()
        .map(|(o, at)| format!("SyntaxError: '{o}' was never closed (line {at})"))
}

fn scan_python(source: &str) -> FileSummary {
    let mut summary = FileSummary::default();
    // (class indent, index into summary.classes, indent of its body)
    let mut open: Vec<(usize, usize, Option<usize>)> = Vec::new();

    for (idx, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = indent_of(line);
        while open.last().is_some_and(|(ci, _, _)| *ci >= indent) {
            open.pop();
        }

        if let Some(c) = PY_FROM.captures(line) {
            for name in split_names(&c[2]) {
                summary.imports.push(format!("{}.{name}", &c[1]));
            }
        } else if let Some(c) = PY_IMPORT.captures(line) {
            summary.imports.extend(split_names(&c[1]).map(str::to_string));
        } else if let Some(c) = PY_CLASS.captures(line) {
            summary.classes.push(ClassSummary {
                name: c[2].to_string(),
                methods: Vec::new(),
                line: idx + 1,
            });
            open.push((indent, summary.classes.len() - 1, None));
        } else if let Some(c) = PY_DEF.captures(line) {
            let name = c[2].to_string();
            if let Some((_, class_idx, body)) = open.last_mut() {
                let body_indent = *body.get_or_insert(indent);
                if body_indent == indent {
                    summary.classes[*class_idx].methods.push(name.clone());
                }
            }
            summary.functions.push(FunctionSig {
                name,
                args: python_args(&c[3]),
                line: idx + 1,
            });
        } else if let Some((_, _, body)) = open.last_mut() {
            body.get_or_insert(indent);
        }
    }
    summary
}

static RS_USE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([^;]+);").unwrap());
static RS_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(\w+)\s*(?:<[^(]*>)?\s*\(([^)]*)"#,
    )
    .unwrap()
});
static RS_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+(\w+)").unwrap()
});
static RS_IMPL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:unsafe\s+)?impl(?:<[^>]*>)?\s+(?:[\w:]+(?:<[^>]*>)?\s+for\s+)?([\w:]+)")
        .unwrap()
});

fn rust_args(args: &str) -> Vec<String> {
    args.split(',')
        .map(|a| {
            let name = a.split(':').next().unwrap_or(a).trim();
            name.trim_start_matches('&')
                .trim_start_matches("mut ")
                .trim_start_matches('\'')
                .trim()
                .to_string()
        })
        .filter(|a| !a.is_empty())
        .collect()
}

fn scan_rust(source: &str) -> FileSummary {
    let mut summary = FileSummary::default();
    let mut depth: usize = 0;
    // (type name, brace depth inside the impl/trait block)
    let mut blocks: Vec<(String, usize)> = Vec::new();

    for (idx, line) in source.lines().enumerate() {
        let code = line.split("//").next().unwrap_or(line);
        if code.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;

        if let Some(c) = RS_USE.captures(code) {
            summary.imports.push(c[1].split_whitespace().collect());
        } else if let Some(c) = RS_FN.captures(code) {
            let name = c[1].to_string();
            if let Some((owner, inner)) = blocks.last()
                && *inner == depth
                && let Some(class) = summary.classes.iter_mut().find(|k| &k.name == owner)
            {
                class.methods.push(name.clone());
            }
            summary.functions.push(FunctionSig {
                name,
                args: rust_args(&c[2]),
                line: line_no,
            });
        } else if let Some(c) = RS_TYPE.captures(code) {
            let name = c[1].to_string();
            if !summary.classes.iter().any(|k| k.name == name) {
                summary.classes.push(ClassSummary {
                    name: name.clone(),
                    methods: Vec::new(),
                    line: line_no,
                });
            }
            if code.contains("trait ") && code.contains('{') {
                blocks.push((name, depth + 1));
            }
        } else if let Some(c) = RS_IMPL.captures(code) {
            let name = c[1].rsplit("::").next().unwrap_or(&c[1]).to_string();
            if !summary.classes.iter().any(|k| k.name == name) {
                summary.classes.push(ClassSummary {
                    name: name.clone(),
                    methods: Vec::new(),
                    line: line_no,
                });
            }
            blocks.push((name, depth + 1));
        }

        for ch in code.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    while blocks.last().is_some_and(|(_, inner)| *inner > depth) {
                        blocks.pop();
                    }
                }
                _ => {}
            }
        }
    }
    summary
}
