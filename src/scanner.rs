//! Document scanner.
//!
//! Walks a root directory and yields [`SourceDocument`] descriptors lazily.
//! Only metadata is touched here; file content is read by the chunking stage.
//! Directory entries are visited in file-name order so two scans of an
//! unchanged tree produce the same sequence.

use chrono::{DateTime, Local, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::error::{Result, SearchError};
use crate::models::{SkippedEntry, SourceDocument};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Resolved scan parameters.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub max_file_bytes: u64,
    pub follow_symlinks: bool,
    pub record_git_revision: bool,
}

impl ScanOptions {
    pub fn from_config(config: &ScannerConfig, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            extensions: config.extensions.clone(),
            exclude_globs: config.exclude_globs.clone(),
            max_file_bytes: config.max_file_bytes,
            follow_symlinks: config.follow_symlinks,
            record_git_revision: config.record_git_revision,
        }
    }
}

/// One step of a scan.
#[derive(Debug, Clone)]
pub enum ScanItem {
    Document(SourceDocument),
    Skipped(SkippedEntry),
}

/// Lazy, restartable sequence of scan results.
pub struct DocumentStream {
    root: PathBuf,
    walker: walkdir::IntoIter,
    excludes: GlobSet,
    extensions: HashSet<String>,
    max_file_bytes: u64,
    record_git_revision: bool,
}

/// Start scanning `options.root`.
///
/// Fails with [`SearchError::Scan`] when the root itself cannot be read.
pub fn scan(options: &ScanOptions) -> Result<DocumentStream> {
    let root = options
        .root
        .canonicalize()
        .map_err(|e| SearchError::Scan {
            path: options.root.clone(),
            message: e.to_string(),
        })?;

    std::fs::read_dir(&root).map_err(|e| SearchError::Scan {
        path: root.clone(),
        message: e.to_string(),
    })?;

    let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    patterns.extend(options.exclude_globs.iter().cloned());
    let excludes = build_globset(&patterns)?;

    let extensions = options
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let walker = WalkDir::new(&root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter();

    Ok(DocumentStream {
        root,
        walker,
        excludes,
        extensions,
        max_file_bytes: options.max_file_bytes,
        record_git_revision: options.record_git_revision,
    })
}

impl DocumentStream {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

impl Iterator for DocumentStream {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    return Some(ScanItem::Skipped(SkippedEntry {
                        path,
                        reason: e.to_string(),
                    }));
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let path = entry.path();
            let rel = self.relative(path);
            let hidden = entry.file_name().to_string_lossy().starts_with('.');

            if entry.file_type().is_dir() {
                // A directory is pruned when anything inside it would be excluded.
                if hidden || self.excludes.is_match(rel.join("_")) {
                    self.walker.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }
            if hidden || self.excludes.is_match(rel) {
                continue;
            }

            let file_type = match path.extension() {
                Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
                None => continue,
            };
            if !self.extensions.contains(&file_type) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    return Some(ScanItem::Skipped(SkippedEntry {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    }))
                }
            };

            if metadata.len() > self.max_file_bytes {
                return Some(ScanItem::Skipped(SkippedEntry {
                    path: path.to_path_buf(),
                    reason: format!(
                        "size {} exceeds limit of {} bytes",
                        metadata.len(),
                        self.max_file_bytes
                    ),
                }));
            }

            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::SystemTime::UNIX_EPOCH));

            let doc_date = date_from_path(rel)
                .unwrap_or_else(|| DateTime::<Local>::from(modified_at).date_naive());

            let revision = if self.record_git_revision {
                git_file_revision(path)
            } else {
                None
            };

            return Some(ScanItem::Document(SourceDocument {
                path: path.to_path_buf(),
                file_type,
                modified_at,
                size: metadata.len(),
                revision,
                doc_date,
            }));
        }
    }
}

/// The last `YYYY-MM-DD` date appearing in a path, if any.
///
/// Journal trees name files and folders by day, and that date is what
/// "yesterday" refers to, not the time the file was last touched.
pub fn date_from_path(path: &Path) -> Option<NaiveDate> {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = DATE_RE.get_or_init(|| {
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("static date regex is valid")
    });
    let s = path.to_string_lossy();
    re.captures_iter(&s)
        .filter_map(|c| {
            let y = c[1].parse().ok()?;
            let m = c[2].parse().ok()?;
            let d = c[3].parse().ok()?;
            NaiveDate::from_ymd_opt(y, m, d)
        })
        .last()
}

/// Last commit hash touching `file_path`, when it lives in a git work tree.
fn git_file_revision(file_path: &Path) -> Option<String> {
    let dir = file_path.parent()?;
    let output = Command::new("git")
        .args(["log", "-1", "--format=%H", "--"])
        .arg(file_path)
        .current_dir(dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        None
    } else {
        Some(sha)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SearchError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SearchError::Config(format!("invalid glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn options(root: &Path) -> ScanOptions {
        ScanOptions::from_config(&ScannerConfig::default(), root)
    }

    fn documents(stream: DocumentStream) -> Vec<SourceDocument> {
        stream
            .filter_map(|item| match item {
                ScanItem::Document(d) => Some(d),
                ScanItem::Skipped(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_scan_filters_by_extension_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("notes")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".obsidian")).unwrap();
        fs::write(root.join("notes/a.md"), "# A").unwrap();
        fs::write(root.join("notes/b.png"), [0u8, 1, 2]).unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "x").unwrap();
        fs::write(root.join(".obsidian/workspace.md"), "x").unwrap();
        fs::write(root.join("main.rs"), "fn main() {}").unwrap();

        let docs = documents(scan(&options(root)).unwrap());
        let names: Vec<String> = docs
            .iter()
            .map(|d| d.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["main.rs", "a.md"]);
        assert_eq!(docs[0].file_type, "rs");
    }

    #[test]
    fn test_scan_is_restartable() {
        let tmp = TempDir::new().unwrap();
        for name in ["c.md", "a.md", "b.txt"] {
            fs::write(tmp.path().join(name), name).unwrap();
        }
        let first = documents(scan(&options(tmp.path())).unwrap());
        let second = documents(scan(&options(tmp.path())).unwrap());
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_size_ceiling_reports_skip() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.md"), "x".repeat(64)).unwrap();
        let mut opts = options(tmp.path());
        opts.max_file_bytes = 10;
        let items: Vec<ScanItem> = scan(&opts).unwrap().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], ScanItem::Skipped(s) if s.reason.contains("exceeds")));
    }

    #[test]
    fn test_missing_root_is_scan_error() {
        let tmp = TempDir::new().unwrap();
        let err = scan(&options(&tmp.path().join("missing"))).err().unwrap();
        assert!(matches!(err, SearchError::Scan { .. }));
    }

    #[test]
    fn test_date_from_path_prefers_last_date() {
        let p = Path::new("2024/2024-05-31/2024-06-01-standup.md");
        assert_eq!(
            date_from_path(p),
            Some(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
        );
        assert_eq!(date_from_path(Path::new("notes/ideas.md")), None);
        assert_eq!(date_from_path(Path::new("2024-13-45.md")), None);
    }

    #[test]
    fn test_doc_date_taken_from_file_name() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("2023-01-15.md"), "entry").unwrap();
        let docs = documents(scan(&options(tmp.path())).unwrap());
        assert_eq!(
            docs[0].doc_date,
            NaiveDate::from_ymd_opt(2023, 1, 15).unwrap()
        );
    }
}
