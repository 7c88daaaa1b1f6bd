//! Maps a recommendation onto a destination file inside the codebase.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::provenance_marker;
use super::scanner::{Category, DirectoryEntry, DirectoryIndex};
use crate::lang::TargetLanguage;
use crate::recommendations::Recommendation;
use crate::text::{slugify, tokenize};

const DECLARED_CATEGORY_WEIGHT: f64 = 3.0;
const MAX_FILE_STEM: usize = 40;
/// Share of title words an existing file must mention to count as related.
const RELATED_TITLE_SHARE: f64 = 0.5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MappingError {
    #[error("no free destination near {path} after {attempts} suffixes")]
    Exhausted { path: PathBuf, attempts: u32 },
}

/// Destination chosen for a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMapping {
    /// Relative to the repository root
    pub relative_path: PathBuf,
    pub category: Option<Category>,
    /// 0.0..=1.0
    pub confidence: f64,
    /// The destination exists and belongs to this recommendation's topic
    pub existing_file: bool,
    /// Original candidate when a disambiguating suffix was applied
    pub renamed_from: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MapperSettings {
    pub default_dir: PathBuf,
    pub language: TargetLanguage,
    pub max_suffix: u32,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            default_dir: PathBuf::from("src"),
            language: TargetLanguage::Python,
            max_suffix: 100,
        }
    }
}

pub struct ProjectStructureMapper {
    index: Arc<DirectoryIndex>,
    settings: MapperSettings,
}

impl ProjectStructureMapper {
    pub fn new(index: Arc<DirectoryIndex>, settings: MapperSettings) -> Self {
        Self { index, settings }
    }

    pub fn root(&self) -> &Path {
        &self.index.root
    }

    /// Pick a destination for `rec`. Paths in `reserved` are claimed by other
    /// in-flight deployments and are treated like unrelated files.
    pub fn map(
        &self,
        rec: &Recommendation,
        reserved: &HashSet<PathBuf>,
    ) -> Result<FileMapping, MappingError> {
        let tokens = tokenize(&rec.search_text());
        let scores = category_scores(rec, &tokens);
        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        let best = scores
            .iter()
            .copied()
            .filter(|(_, s)| *s > 0.0)
            .fold(None::<(Category, f64)>, |acc, (c, s)| match acc {
                Some((_, best)) if best >= s => acc,
                _ => Some((c, s)),
            });

        let (directory, category, confidence) = match best {
            Some((category, score)) => {
                let share = score / total;
                match self.best_directory(category, &tokens) {
                    Some(dir) => (dir.rel_path.clone(), Some(category), share),
                    None => (self.settings.default_dir.clone(), Some(category), share * 0.4),
                }
            }
            None => (self.settings.default_dir.clone(), None, 0.1),
        };

        let candidate = directory.join(self.file_name(rec, None));
        let mapping = self.resolve_collision(rec, candidate, category, confidence, reserved)?;
        info!(
            recommendation.id = %rec.id,
            path = %mapping.relative_path.display(),
            category = ?mapping.category,
            confidence = mapping.confidence,
            "Mapped recommendation to destination"
        );
        Ok(mapping)
    }

    /// Move `previous` to the next free suffixed name. Used when analysis
    /// finds the chosen destination conflicts with existing content.
    pub fn remap_with_suffix(
        &self,
        rec: &Recommendation,
        previous: &FileMapping,
        reserved: &HashSet<PathBuf>,
    ) -> Result<FileMapping, MappingError> {
        let original = previous
            .renamed_from
            .clone()
            .unwrap_or_else(|| previous.relative_path.clone());
        let mut reserved = reserved.clone();
        reserved.insert(previous.relative_path.clone());
        self.resolve_collision(rec, original, previous.category, previous.confidence, &reserved)
    }

    fn best_directory(&self, category: Category, tokens: &BTreeSet<String>) -> Option<&DirectoryEntry> {
        self.index.for_category(category).max_by(|a, b| {
            let key = |d: &DirectoryEntry| {
                let name_hits = d.name_words().iter().filter(|w| tokens.contains(*w)).count();
                (
                    d.category_score(category) as usize + name_hits,
                    d.source_files.len(),
                    usize::MAX - d.depth,
                )
            };
            key(a).cmp(&key(b)).then_with(|| b.rel_path.cmp(&a.rel_path))
        })
    }

    fn file_name(&self, rec: &Recommendation, suffix: Option<u32>) -> String {
        let mut stem = slugify(&rec.title, '_', MAX_FILE_STEM);
        if stem.is_empty() {
            stem = slugify(&rec.id, '_', MAX_FILE_STEM);
        }
        if stem.is_empty() || stem.starts_with(|c: char| c.is_ascii_digit()) {
            stem = format!("rec_{stem}");
        }
        match suffix {
            Some(n) => format!("{stem}_{n}.{}", self.settings.language.extension()),
            None => format!("{stem}.{}", self.settings.language.extension()),
        }
    }

    fn resolve_collision(
        &self,
        rec: &Recommendation,
        candidate: PathBuf,
        category: Option<Category>,
        confidence: f64,
        reserved: &HashSet<PathBuf>,
    ) -> Result<FileMapping, MappingError> {
        let directory = candidate.parent().map(Path::to_path_buf).unwrap_or_default();

        for attempt in 1..=self.settings.max_suffix {
            let path = if attempt == 1 {
                candidate.clone()
            } else {
                directory.join(self.file_name(rec, Some(attempt)))
            };

            if reserved.contains(&path) {
                continue;
            }
            match self.existing_relation(rec, &path) {
                Relation::Free => {
                    return Ok(self.mapping(path, &candidate, category, confidence, false));
                }
                Relation::Related => {
                    return Ok(self.mapping(path, &candidate, category, confidence, true));
                }
                Relation::Unrelated => {
                    debug!(
                        recommendation.id = %rec.id,
                        path = %path.display(),
                        "Destination holds unrelated content; trying next suffix"
                    );
                }
            }
        }

        Err(MappingError::Exhausted {
            path: candidate,
            attempts: self.settings.max_suffix,
        })
    }

    fn mapping(
        &self,
        path: PathBuf,
        candidate: &Path,
        category: Option<Category>,
        confidence: f64,
        existing_file: bool,
    ) -> FileMapping {
        let renamed_from = (path != candidate).then(|| candidate.to_path_buf());
        FileMapping {
            relative_path: path,
            category,
            confidence: confidence.clamp(0.0, 1.0),
            existing_file,
            renamed_from,
        }
    }

    fn existing_relation(&self, rec: &Recommendation, rel: &Path) -> Relation {
        let full = self.index.root.join(rel);
        if !full.exists() {
            return Relation::Free;
        }
        match std::fs::read_to_string(&full) {
            Ok(content) if content.trim().is_empty() => Relation::Free,
            Ok(content) if is_related(rec, &content) => Relation::Related,
            _ => Relation::Unrelated,
        }
    }
}

enum Relation {
    Free,
    Related,
    Unrelated,
}

/// Whether existing `content` is about the same feature as `rec`.
pub fn is_related(rec: &Recommendation, content: &str) -> bool {
    if content.contains(&provenance_marker(&rec.id)) {
        return true;
    }
    let title_tokens = tokenize(&rec.title);
    if title_tokens.is_empty() {
        return false;
    }
    let content_tokens = tokenize(content);
    let shared = title_tokens.intersection(&content_tokens).count();
    shared as f64 / title_tokens.len() as f64 >= RELATED_TITLE_SHARE
}

fn category_scores(rec: &Recommendation, tokens: &BTreeSet<String>) -> Vec<(Category, f64)> {
    let declared = Category::from_label(&rec.category);
    Category::ALL
        .into_iter()
        .filter(|c| *c != Category::Tests)
        .map(|category| {
            let hits = category
                .keywords()
                .iter()
                .filter(|k| tokens.contains(**k) || tokens.contains(k.trim_end_matches('s')))
                .count() as f64;
            let bonus = if declared == Some(category) {
                DECLARED_CATEGORY_WEIGHT
            } else {
                0.0
            };
            (category, hits + bonus)
        })
        .collect()
}
