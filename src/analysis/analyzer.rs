use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::similarity::QueryTokens;
use crate::inventory::{DatasetReference, InventorySummary};
use crate::lang::{parse_source, ParsedSource, SymbolKind, TargetLanguage};
use crate::recommendations::Recommendation;
use crate::structure::{is_related, FileMapping};

const MAX_SOURCE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStrategy {
    NewFile,
    ExtendExisting,
    Replace,
}

impl IntegrationStrategy {
    /// Strategies that rewrite a file whose existing symbols must survive.
    pub fn preserves_existing(self) -> bool {
        !matches!(self, IntegrationStrategy::NewFile)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub file: PathBuf,
    pub line: usize,
    pub score: f64,
    pub signature: String,
}

/// Integration plan for one recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationAnalysis {
    pub candidate_file_path: PathBuf,
    pub integration_strategy: IntegrationStrategy,
    /// Best matches first
    pub similar_existing_symbols: Vec<SimilarSymbol>,
    pub required_imports: Vec<String>,
    pub conflict_flag: bool,
    /// Top-level names the candidate already defines
    pub existing_top_level_symbols: Vec<String>,
    #[serde(skip)]
    pub existing_source: Option<String>,
    pub dataset_references: Vec<DatasetReference>,
    pub unknown_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    /// In-file similarity at or above which the closest symbol is replaced
    pub replace_threshold: f64,
    /// Below this, existing non-empty content counts as unrelated
    pub related_threshold: f64,
    /// Minimum score for a symbol to be reported as similar
    pub min_similarity: f64,
    pub max_similar_symbols: usize,
    pub max_neighbor_files: usize,
    pub max_required_imports: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            replace_threshold: 0.8,
            related_threshold: 0.2,
            min_similarity: 0.3,
            max_similar_symbols: 8,
            max_neighbor_files: 20,
            max_required_imports: 10,
        }
    }
}

pub struct CodeIntegrationAnalyzer {
    root: PathBuf,
    language: TargetLanguage,
    settings: AnalyzerSettings,
}

struct ParsedFile {
    rel_path: PathBuf,
    parsed: ParsedSource,
}

impl CodeIntegrationAnalyzer {
    pub fn new(root: impl Into<PathBuf>, language: TargetLanguage, settings: AnalyzerSettings) -> Self {
        Self {
            root: root.into(),
            language,
            settings,
        }
    }

    pub fn analyze(
        &self,
        rec: &Recommendation,
        mapping: &FileMapping,
        inventory: &InventorySummary,
    ) -> std::io::Result<IntegrationAnalysis> {
        let query = QueryTokens::new(&rec.title, &rec.search_text());
        let candidate_rel = mapping.relative_path.clone();
        let candidate_abs = self.root.join(&candidate_rel);

        let existing_source = match fs::read_to_string(&candidate_abs) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        let candidate = existing_source
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|content| self.parse(&candidate_rel, content));

        let neighbors = self.neighbors(&candidate_rel);

        let mut similar: Vec<SimilarSymbol> = candidate
            .iter()
            .chain(neighbors.iter())
            .flat_map(|file| {
                file.parsed.symbols.iter().map(|s| SimilarSymbol {
                    name: s.name.clone(),
                    kind: s.kind,
                    file: file.rel_path.clone(),
                    line: s.line,
                    score: query.score_identifier(&s.name),
                    signature: s.signature.clone(),
                })
            })
            .filter(|s| s.score >= self.settings.min_similarity)
            .collect();
        similar.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.line.cmp(&b.line))
        });
        similar.truncate(self.settings.max_similar_symbols);

        let best_in_file = candidate
            .as_ref()
            .map(|file| {
                file.parsed
                    .symbols
                    .iter()
                    .map(|s| query.score_identifier(&s.name))
                    .fold(0.0_f64, f64::max)
            })
            .unwrap_or(0.0);

        let (integration_strategy, conflict_flag) = match (&existing_source, &candidate) {
            (None, _) => (IntegrationStrategy::NewFile, false),
            // present but blank: nothing to preserve
            (Some(_), None) => (IntegrationStrategy::NewFile, false),
            (Some(content), Some(_)) => {
                let strategy = if best_in_file >= self.settings.replace_threshold {
                    IntegrationStrategy::Replace
                } else {
                    IntegrationStrategy::ExtendExisting
                };
                let related = mapping.existing_file
                    || is_related(rec, content)
                    || best_in_file >= self.settings.related_threshold;
                (strategy, !related)
            }
        };

        let existing_top_level_symbols = candidate
            .as_ref()
            .map(|f| f.parsed.top_level_names().into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        let required_imports = self.required_imports(&query, candidate.as_ref(), &neighbors);
        let resolution = inventory.resolve(&rec.data_requirements);
        if !resolution.unknown_tables.is_empty() {
            warn!(
                recommendation.id = %rec.id,
                tables = ?resolution.unknown_tables,
                "Recommendation references tables missing from the inventory"
            );
        }

        info!(
            recommendation.id = %rec.id,
            path = %candidate_rel.display(),
            strategy = ?integration_strategy,
            conflict = conflict_flag,
            similar = similar.len(),
            "Integration analysis complete"
        );

        Ok(IntegrationAnalysis {
            candidate_file_path: candidate_rel,
            integration_strategy,
            similar_existing_symbols: similar,
            required_imports,
            conflict_flag,
            existing_top_level_symbols,
            existing_source,
            dataset_references: resolution.references,
            unknown_tables: resolution.unknown_tables,
        })
    }

    fn parse(&self, rel_path: &Path, content: &str) -> ParsedFile {
        let parsed = match parse_source(content, self.language) {
            Ok(parsed) => parsed,
            Err(issue) => {
                warn!(path = %rel_path.display(), error = %issue, "Could not parse source file");
                ParsedSource::default()
            }
        };
        ParsedFile {
            rel_path: rel_path.to_path_buf(),
            parsed,
        }
    }

    /// Same-language files in the candidate's directory.
    fn neighbors(&self, candidate_rel: &Path) -> Vec<ParsedFile> {
        let dir_rel = candidate_rel.parent().unwrap_or(Path::new(""));
        let Ok(entries) = fs::read_dir(self.root.join(dir_rel)) else {
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.metadata().map(|m| m.len() <= MAX_SOURCE_BYTES).unwrap_or(false))
            .map(|e| dir_rel.join(e.file_name()))
            .filter(|p| self.language.matches(p) && p != candidate_rel)
            .collect();
        paths.sort();
        paths.truncate(self.settings.max_neighbor_files);

        paths
            .into_iter()
            .filter_map(|rel| {
                let content = fs::read_to_string(self.root.join(&rel)).ok()?;
                Some(self.parse(&rel, &content))
            })
            .inspect(|f| debug!(path = %f.rel_path.display(), symbols = f.parsed.symbols.len(), "Parsed neighbor"))
            .collect()
    }

    /// Imports neighbors share or that mention the recommendation's topic,
    /// minus those the candidate already has.
    fn required_imports(
        &self,
        query: &QueryTokens,
        candidate: Option<&ParsedFile>,
        neighbors: &[ParsedFile],
    ) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for file in neighbors {
            for import in &file.parsed.imports {
                *counts.entry(import.as_str()).or_insert(0) += 1;
            }
        }

        let already: Vec<&str> = candidate
            .map(|f| f.parsed.imports.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let mut ranked: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(import, count)| *count >= 2 || query.mentions(import))
            .filter(|(import, _)| !already.contains(import))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.settings.max_required_imports)
            .map(|(import, _)| import.to_string())
            .collect()
    }
}
