//! Walks the destination codebase and builds a categorized directory index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::lang::TargetLanguage;
use crate::text::split_identifier;

/// Topic buckets used to place new code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Analytics,
    Api,
    Ml,
    Deployment,
    DataProcessing,
    Visualization,
    Utils,
    Tests,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Analytics,
        Category::Api,
        Category::Ml,
        Category::Deployment,
        Category::DataProcessing,
        Category::Visualization,
        Category::Utils,
        Category::Tests,
    ];

    /// Words that signal this topic in directory names and recommendation text.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Category::Analytics => &[
                "analytics", "analysis", "stat", "statistic", "metric", "calc", "calculation",
                "percentage", "pct", "efficiency", "rating", "kpi", "aggregate", "shooting",
                "scoring", "advanced",
            ],
            Category::Api => &[
                "api", "endpoint", "route", "server", "rest", "graphql", "handler", "http",
                "service", "request", "webhook",
            ],
            Category::Ml => &[
                "ml", "model", "training", "train", "predict", "prediction", "classifier",
                "regression", "embedding", "neural", "learning", "inference", "forecast",
            ],
            Category::Deployment => &[
                "deploy", "deployment", "infra", "infrastructure", "docker", "k8s", "kubernetes",
                "ci", "ops", "terraform", "release",
            ],
            Category::DataProcessing => &[
                "etl", "data", "ingest", "ingestion", "processing", "transform", "loader",
                "pipeline", "cleaning", "scraper", "scraping", "parser", "import",
            ],
            Category::Visualization => &[
                "viz", "visualization", "chart", "plot", "plotting", "dashboard", "graph",
            ],
            Category::Utils => &["util", "utils", "helper", "common", "shared", "core", "lib"],
            Category::Tests => &["test", "tests", "spec", "fixture"],
        }
    }

    /// Lenient parse of a recommendation's free-form `category` field.
    pub fn from_label(label: &str) -> Option<Category> {
        let normalized = label.trim().to_lowercase().replace(['_', ' '], "-");
        let exact = match normalized.as_str() {
            "analytics" | "analysis" | "statistics" => Some(Category::Analytics),
            "api" => Some(Category::Api),
            "ml" | "machine-learning" | "modeling" => Some(Category::Ml),
            "deployment" | "infrastructure" | "devops" => Some(Category::Deployment),
            "data-processing" | "data" | "etl" | "data-pipeline" => Some(Category::DataProcessing),
            "visualization" | "viz" => Some(Category::Visualization),
            "utils" | "utilities" => Some(Category::Utils),
            _ => None,
        };
        exact.or_else(|| {
            Category::ALL
                .into_iter()
                .filter(|c| *c != Category::Tests)
                .find(|c| normalized.split('-').any(|w| c.keywords().contains(&w)))
        })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Analytics => "analytics",
            Category::Api => "api",
            Category::Ml => "ml",
            Category::Deployment => "deployment",
            Category::DataProcessing => "data-processing",
            Category::Visualization => "visualization",
            Category::Utils => "utils",
            Category::Tests => "tests",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    /// Path relative to the repository root; empty for the root itself
    pub rel_path: PathBuf,
    pub depth: usize,
    /// Category -> number of path components naming it
    pub categories: BTreeMap<Category, u32>,
    pub source_files: Vec<PathBuf>,
}

impl DirectoryEntry {
    pub fn category_score(&self, category: Category) -> u32 {
        self.categories.get(&category).copied().unwrap_or(0)
    }

    pub fn is_test_dir(&self) -> bool {
        self.category_score(Category::Tests) > 0
    }

    pub fn name_words(&self) -> Vec<String> {
        self.rel_path
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .flat_map(split_identifier)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryIndex {
    pub root: PathBuf,
    pub directories: Vec<DirectoryEntry>,
}

impl DirectoryIndex {
    pub fn for_category(&self, category: Category) -> impl Iterator<Item = &DirectoryEntry> {
        self.directories
            .iter()
            .filter(move |d| d.category_score(category) > 0 && !d.is_test_dir())
    }

    pub fn source_file_count(&self) -> usize {
        self.directories.iter().map(|d| d.source_files.len()).sum()
    }
}

pub struct ProjectScanner {
    ignore_patterns: Vec<String>,
    language: TargetLanguage,
}

impl ProjectScanner {
    pub fn new(ignore_patterns: Vec<String>, language: TargetLanguage) -> Self {
        Self {
            ignore_patterns,
            language,
        }
    }

    /// Walk `root` and index every non-ignored directory.
    pub fn scan(&self, root: &Path) -> std::io::Result<DirectoryIndex> {
        let mut by_dir: BTreeMap<PathBuf, DirectoryEntry> = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_ignored(e));

        for entry in walker {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop while scanning"))
            })?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();

            if entry.file_type().is_dir() {
                by_dir
                    .entry(rel.clone())
                    .or_insert_with(|| categorize(rel, entry.depth()));
            } else if entry.file_type().is_file() && self.language.matches(entry.path()) {
                let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
                if let Some(dir) = by_dir.get_mut(&parent) {
                    dir.source_files.push(rel);
                }
            }
        }

        let index = DirectoryIndex {
            root: root.to_path_buf(),
            directories: by_dir.into_values().collect(),
        };
        debug!(
            root = %root.display(),
            directories = index.directories.len(),
            source_files = index.source_file_count(),
            "Scanned project structure"
        );
        Ok(index)
    }

    fn is_ignored(&self, entry: &DirEntry) -> bool {
        let Some(name) = entry.file_name().to_str() else {
            return true;
        };
        if entry.file_type().is_dir() && name.starts_with('.') {
            return true;
        }
        self.ignore_patterns.iter().any(|p| pattern_matches(p, name))
    }
}

/// Shell-style match on a single path component; supports a leading and/or
/// trailing `*`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        (Some(rest), _) if rest.ends_with('*') => name.contains(&rest[..rest.len() - 1]),
        (Some(suffix), _) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name == pattern,
    }
}

fn categorize(rel_path: PathBuf, depth: usize) -> DirectoryEntry {
    let mut categories = BTreeMap::new();
    for word in rel_path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .flat_map(split_identifier)
    {
        let singular = word.strip_suffix('s').unwrap_or(&word).to_string();
        for category in Category::ALL {
            let keywords = category.keywords();
            if keywords.contains(&word.as_str()) || keywords.contains(&singular.as_str()) {
                *categories.entry(category).or_insert(0) += 1;
            }
        }
    }
    DirectoryEntry {
        rel_path,
        depth,
        categories,
        source_files: Vec::new(),
    }
}
