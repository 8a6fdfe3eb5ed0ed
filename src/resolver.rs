//! Path & source resolver and breakpoint-line validator (component F).

use std::path::{Path, PathBuf};

/// How a path candidate was chosen, kept for audit/debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Absolute,
    RepoRooted,
    CwdRooted,
    FirstCandidateFallback,
}

#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub provenance: Provenance,
}

/// Resolves `source_path` against `repo_root` and `cwd`, following the
/// ordered-candidate rule: absolute paths are canonicalized as-is;
/// relative paths whose first segment names a top-level entry of
/// `repo_root` prefer `repo_root / path`; all other relative paths try
/// `repo_root / path`, then `cwd / path`, then a raw canonicalize. The
/// first candidate that exists on disk wins; if none exist, the first
/// candidate is used verbatim.
pub fn resolve_source_path(source_path: &str, repo_root: &Path, cwd: &Path) -> ResolvedPath {
    let raw = Path::new(source_path);

    if raw.is_absolute() {
        let canonical = raw.canonicalize().unwrap_or_else(|_| raw.to_path_buf());
        return ResolvedPath { path: canonical, provenance: Provenance::Absolute };
    }

    let first_segment = raw.components().next().and_then(|c| c.as_os_str().to_str());
    let looks_repo_rooted = first_segment
        .map(|seg| repo_root_has_top_level(repo_root, seg))
        .unwrap_or(false);

    let mut candidates: Vec<(PathBuf, Provenance)> = Vec::new();
    if looks_repo_rooted {
        candidates.push((repo_root.join(raw), Provenance::RepoRooted));
        candidates.push((canonical_or_raw(raw), Provenance::FirstCandidateFallback));
    } else {
        candidates.push((repo_root.join(raw), Provenance::RepoRooted));
        candidates.push((cwd.join(raw), Provenance::CwdRooted));
        candidates.push((canonical_or_raw(raw), Provenance::FirstCandidateFallback));
    }

    // Deduplicate while preserving order.
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|(p, _)| seen.insert(p.clone()));

    for (path, provenance) in &candidates {
        if path.exists() {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            return ResolvedPath { path: canonical, provenance: *provenance };
        }
    }

    let (path, provenance) = candidates.into_iter().next().expect("at least one candidate");
    ResolvedPath { path, provenance }
}

fn canonical_or_raw(raw: &Path) -> PathBuf {
    raw.canonicalize().unwrap_or_else(|_| raw.to_path_buf())
}

fn repo_root_has_top_level(repo_root: &Path, name: &str) -> bool {
    std::fs::read_dir(repo_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_str() == Some(name))
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Breakpoint-line validator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub line: usize,
    pub content: String,
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug)]
pub enum ValidationError {
    FileNotFound { path: PathBuf },
    LineOutOfRange { line: usize, total_lines: usize },
    Io(std::io::Error),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileNotFound { path } => write!(f, "File not found: {}", path.display()),
            Self::LineOutOfRange { line, total_lines } => {
                write!(f, "Line number out of range: {line} (file has {total_lines} lines)")
            }
            Self::Io(e) => write!(f, "i/o error reading source file: {e}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Reads `path` (UTF-8) and classifies `line` (1-based) for breakpoint
/// suitability. Pure function of file contents and line number.
pub fn validate_breakpoint_line(path: &Path, line: usize) -> Result<ValidationResult, ValidationError> {
    if !path.exists() {
        return Err(ValidationError::FileNotFound { path: path.to_path_buf() });
    }

    let contents = std::fs::read_to_string(path).map_err(ValidationError::Io)?;
    let lines: Vec<&str> = contents.lines().collect();

    if line == 0 || line > lines.len() {
        return Err(ValidationError::LineOutOfRange { line, total_lines: lines.len() });
    }

    let target = lines[line - 1].trim();
    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();

    if target.starts_with("def ") || target.starts_with("async def ") {
        warnings.push("function-definition line".to_string());
        if line < lines.len() {
            suggestions.push(format!("line {}", line + 1));
        }
        suggestions.push("break at the call site and step in instead".to_string());
    }

    if target.starts_with("class ") {
        warnings.push("class-definition line".to_string());
        suggestions.push("break inside __init__ or a method instead".to_string());
    }

    if target.is_empty() || target.starts_with('#') {
        warnings.push("comment or blank".to_string());
        for (i, candidate) in lines.iter().enumerate().skip(line).take(5) {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !candidate.starts_with('#') {
                suggestions.push(format!("line {}", i + 1));
                break;
            }
        }
    }

    if target.starts_with("import ") || target.starts_with("from ") {
        warnings.push("import statement".to_string());
        suggestions.push("break inside a function instead".to_string());
    }

    Ok(ValidationResult {
        line,
        content: target.to_string(),
        is_valid: warnings.is_empty(),
        warnings,
        suggestions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(contents)
    }

    // Minimal self-contained temp-file helper so this module's tests do not
    // depend on an external tempfile crate.
    mod tempfile_path {
        use std::io::Write;
        use std::path::PathBuf;

        pub struct TempFile {
            pub path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "dap-broker-validator-test-{}-{}.py",
                    std::process::id(),
                    contents.len()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn flags_function_definition_line() {
        let f = write_temp("def my_function():\n    x = 42\n");
        let result = validate_breakpoint_line(&f.path, 1).unwrap();
        assert!(!result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("function-definition")));
        assert!(result.suggestions.iter().any(|s| s.contains("line 2")));
    }

    #[test]
    fn second_line_is_valid() {
        let f = write_temp("def my_function():\n    x = 42\n");
        let result = validate_breakpoint_line(&f.path, 2).unwrap();
        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
        assert_eq!(result.content, "x = 42");
    }

    #[test]
    fn out_of_range_line_is_an_error() {
        let f = write_temp("a = 1\n");
        let err = validate_breakpoint_line(&f.path, 99).unwrap_err();
        assert!(matches!(err, ValidationError::LineOutOfRange { line: 99, total_lines: 1 }));
    }

    #[test]
    fn line_zero_is_out_of_range() {
        let f = write_temp("a = 1\n");
        let err = validate_breakpoint_line(&f.path, 0).unwrap_err();
        assert!(matches!(err, ValidationError::LineOutOfRange { line: 0, .. }));
    }

    #[test]
    fn blank_line_suggests_next_nonblank_nonblank() {
        let f = write_temp("x = 1\n\n# comment\ny = 2\n");
        let result = validate_breakpoint_line(&f.path, 2).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("comment or blank")));
        assert!(result.suggestions.iter().any(|s| s.contains("line 4")));
    }

    #[test]
    fn import_statement_is_flagged() {
        let f = write_temp("import os\n");
        let result = validate_breakpoint_line(&f.path, 1).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("import statement")));
    }
}
