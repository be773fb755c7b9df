// src/templates/catalog.rs
//! Template catalog: resolves user-supplied paths, directories, and glob
//! patterns into concrete template files, honouring an ignore list.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::TemplarError;

pub const IGNORE_FILE: &str = ".templar-ignore";

/// Ignore list: file globs and tags excluded at load time
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgnoreList {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl IgnoreList {
    /// Load the ignore file from the templates root; a missing file is an
    /// empty list.
    pub fn load(root: &Path) -> Self {
        let path = root.join(IGNORE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(list) => list,
                Err(e) => {
                    warn!("ignore file {} is malformed: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let rendered = path.to_string_lossy();
        self.files
            .iter()
            .any(|pattern| glob_matches(pattern, &rendered))
    }
}

/// Resolves template path arguments against a root directory
pub struct Catalog {
    root: PathBuf,
    ignore: IgnoreList,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ignore = IgnoreList::load(&root);
        Self { root, ignore }
    }

    pub fn ignore(&self) -> &IgnoreList {
        &self.ignore
    }

    /// Resolve each argument as a file, a directory (recursive), or a glob
    /// pattern. Results are deduplicated and sorted for deterministic load
    /// order.
    pub fn resolve(&self, patterns: &[String]) -> Result<Vec<PathBuf>, TemplarError> {
        let mut found = BTreeSet::new();

        for pattern in patterns {
            let candidate = self.absolute(pattern);

            if candidate.is_file() {
                found.insert(candidate);
                continue;
            }
            if candidate.is_dir() {
                for path in self.walk(&candidate) {
                    found.insert(path);
                }
                continue;
            }
            if pattern.contains('*') || pattern.contains('?') {
                let matched = self.resolve_glob(pattern);
                if matched.is_empty() {
                    warn!("glob {} matched no templates", pattern);
                }
                found.extend(matched);
                continue;
            }

            return Err(TemplarError::Config(format!(
                "template path does not exist: {}",
                pattern
            )));
        }

        let paths: Vec<PathBuf> = found
            .into_iter()
            .filter(|p| !self.ignore.is_ignored(p))
            .collect();
        debug!("catalog resolved {} template files", paths.len());
        Ok(paths)
    }

    fn absolute(&self, pattern: &str) -> PathBuf {
        let path = PathBuf::from(pattern);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    fn walk(&self, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_template_file(path))
            .collect()
    }

    fn resolve_glob(&self, pattern: &str) -> Vec<PathBuf> {
        let full = self.absolute(pattern);
        let rendered = full.to_string_lossy().to_string();
        // Walk from the deepest literal prefix of the pattern
        let base = full
            .ancestors()
            .find(|a| !a.to_string_lossy().contains('*') && !a.to_string_lossy().contains('?'))
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        self.walk(&base)
            .into_iter()
            .filter(|path| glob_matches(&rendered, &path.to_string_lossy()))
            .collect()
    }
}

fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Minimal glob matching: `**` spans separators, `*` does not, `?` is one
/// character. Built on the regex crate; unsupported metacharacters are
/// escaped literally.
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map(|re| re.is_match(candidate))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("templar-catalog-{}-{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_glob_single_star_stops_at_separator() {
        assert!(glob_matches("/t/*.yaml", "/t/a.yaml"));
        assert!(!glob_matches("/t/*.yaml", "/t/sub/a.yaml"));
        assert!(glob_matches("/t/**/*.yaml", "/t/sub/a.yaml"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_matches("a?.yaml", "ab.yaml"));
        assert!(!glob_matches("a?.yaml", "abc.yaml"));
    }

    #[test]
    fn test_resolve_directory_recursive() {
        let root = temp_root("dir");
        fs::create_dir_all(root.join("http/panels")).unwrap();
        fs::write(root.join("http/a.yaml"), "id: a").unwrap();
        fs::write(root.join("http/panels/b.yml"), "id: b").unwrap();
        fs::write(root.join("http/readme.md"), "not a template").unwrap();

        let catalog = Catalog::new(&root);
        let paths = catalog.resolve(&["http".to_string()]).unwrap();
        assert_eq!(paths.len(), 2);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_resolve_missing_path_is_config_error() {
        let root = temp_root("missing");
        let catalog = Catalog::new(&root);
        let err = catalog.resolve(&["does-not-exist".to_string()]).unwrap_err();
        assert!(matches!(err, TemplarError::Config(_)));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_ignore_list_filters_files() {
        let root = temp_root("ignore");
        fs::write(root.join("keep.yaml"), "id: keep").unwrap();
        fs::write(root.join("drop.yaml"), "id: drop").unwrap();
        fs::write(
            root.join(IGNORE_FILE),
            "files:\n  - \"**/drop.yaml\"\n",
        )
        .unwrap();

        let catalog = Catalog::new(&root);
        let paths = catalog.resolve(&[".".to_string()]).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("keep.yaml"));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_resolve_glob_pattern() {
        let root = temp_root("glob");
        fs::write(root.join("cve-a.yaml"), "id: a").unwrap();
        fs::write(root.join("panel-b.yaml"), "id: b").unwrap();

        let catalog = Catalog::new(&root);
        let paths = catalog.resolve(&["cve-*.yaml".to_string()]).unwrap();
        assert_eq!(paths.len(), 1);
        fs::remove_dir_all(&root).unwrap();
    }
}
