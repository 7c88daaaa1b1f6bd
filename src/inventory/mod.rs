//! Data-inventory collaborator
//!
//! The inventory catalogue is owned by another subsystem; the pipeline only
//! reads a summary of it (tables, columns, record counts, date coverage) to
//! ground generated code in real dataset names.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::recommendations::{DataRequirements, DateRange};

#[derive(Debug, Error, Clone)]
pub enum InventoryError {
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
    #[error("inventory summary is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySummary {
    #[serde(default)]
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub date_coverage: Option<DateRange>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A requested table matched against the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReference {
    pub table: String,
    /// Requested columns the inventory knows about, or every known column
    /// when the recommendation did not name any.
    pub columns: Vec<String>,
    pub missing_columns: Vec<String>,
    pub record_count: u64,
    pub date_coverage: Option<DateRange>,
    /// `None` when either side has no date range
    pub covers_requested_range: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetResolution {
    pub references: Vec<DatasetReference>,
    pub unknown_tables: Vec<String>,
}

impl InventorySummary {
    pub fn table(&self, name: &str) -> Option<&TableSummary> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Match a recommendation's data requirements against known datasets.
    pub fn resolve(&self, requirements: &DataRequirements) -> DatasetResolution {
        let mut resolution = DatasetResolution::default();

        for requested in &requirements.tables {
            let Some(table) = self.table(requested) else {
                resolution.unknown_tables.push(requested.clone());
                continue;
            };

            let wanted = requirements.columns_for(requested);
            let (columns, missing_columns) = if wanted.is_empty() {
                (table.columns.clone(), Vec::new())
            } else {
                let (known, missing): (Vec<String>, Vec<String>) = wanted
                    .into_iter()
                    .partition(|c| table.columns.iter().any(|k| k.eq_ignore_ascii_case(c)));
                (known, missing)
            };

            let covers_requested_range = match (requirements.date_range, table.date_coverage) {
                (Some(req), Some(cov)) => Some(cov.start <= req.start && req.end <= cov.end),
                _ => None,
            };

            resolution.references.push(DatasetReference {
                table: table.name.clone(),
                columns,
                missing_columns,
                record_count: table.record_count,
                date_coverage: table.date_coverage,
                covers_requested_range,
            });
        }

        resolution
    }

    /// Compact one-line-per-table rendering for prompts.
    pub fn render_compact(&self, max_tables: usize) -> String {
        self.tables
            .iter()
            .take(max_tables)
            .map(|t| {
                let coverage = t
                    .date_coverage
                    .map(|r| format!(" [{} .. {}]", r.start, r.end))
                    .unwrap_or_default();
                format!(
                    "- {} ({} rows){}: {}",
                    t.name,
                    t.record_count,
                    coverage,
                    t.columns.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Read-only provider of the inventory summary.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn inventory_summary(&self) -> Result<InventorySummary, InventoryError>;
}

/// Provider used when no inventory is configured.
#[derive(Debug, Default, Clone)]
pub struct EmptyInventory;

#[async_trait]
impl InventoryProvider for EmptyInventory {
    async fn inventory_summary(&self) -> Result<InventorySummary, InventoryError> {
        Ok(InventorySummary::default())
    }
}

/// Reads a summary exported as JSON by the cataloguing subsystem.
#[derive(Debug, Clone)]
pub struct JsonFileInventory {
    path: PathBuf,
}

impl JsonFileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InventoryProvider for JsonFileInventory {
    async fn inventory_summary(&self) -> Result<InventorySummary, InventoryError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            InventoryError::Unavailable(format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| InventoryError::Malformed(e.to_string()))
    }
}

/// Caches the summary so a batch reads the catalogue once per TTL.
pub struct CachedInventory {
    inner: Arc<dyn InventoryProvider>,
    cache: Cache<&'static str, Arc<InventorySummary>>,
}

impl CachedInventory {
    const KEY: &'static str = "summary";

    pub fn new(inner: Arc<dyn InventoryProvider>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { inner, cache }
    }

    /// Summary, or an empty one when the collaborator is unavailable. The
    /// inventory only enriches analysis, so its failure never fails an item.
    pub async fn summary_or_empty(&self) -> Arc<InventorySummary> {
        match self.summary().await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "Inventory summary unavailable; continuing without it");
                Arc::new(InventorySummary::default())
            }
        }
    }

    pub async fn summary(&self) -> Result<Arc<InventorySummary>, InventoryError> {
        let inner = self.inner.clone();
        self.cache
            .try_get_with(Self::KEY, async move {
                debug!("Fetching inventory summary");
                inner.inventory_summary().await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<InventoryError>| (*e).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    fn summary() -> InventorySummary {
        InventorySummary {
            tables: vec![TableSummary {
                name: "games".into(),
                columns: vec!["game_id".into(), "fgm".into(), "fga".into()],
                record_count: 1200,
                date_coverage: Some(DateRange {
                    start: date(2015, 1, 1).unwrap(),
                    end: date(2024, 6, 30).unwrap(),
                }),
                description: None,
            }],
        }
    }

    #[test]
    fn test_resolve_known_and_unknown_tables() {
        let reqs = DataRequirements {
            tables: vec!["GAMES".into(), "tracking".into()],
            columns: vec!["fgm".into(), "games.three_pa".into()],
            date_range: Some(DateRange {
                start: date(2020, 1, 1).unwrap(),
                end: date(2021, 1, 1).unwrap(),
            }),
        };
        let resolution = summary().resolve(&reqs);
        assert_eq!(resolution.unknown_tables, vec!["tracking"]);
        let games = &resolution.references[0];
        assert_eq!(games.table, "games");
        assert_eq!(games.columns, vec!["fgm"]);
        assert_eq!(games.missing_columns, vec!["three_pa"]);
        assert_eq!(games.covers_requested_range, Some(true));
    }

    #[test]
    fn test_resolve_without_columns_uses_all_known() {
        let reqs = DataRequirements {
            tables: vec!["games".into()],
            ..Default::default()
        };
        let resolution = summary().resolve(&reqs);
        assert_eq!(resolution.references[0].columns.len(), 3);
        assert_eq!(resolution.references[0].covers_requested_range, None);
    }

    struct CountingInventory(AtomicU32);

    #[async_trait]
    impl InventoryProvider for CountingInventory {
        async fn inventory_summary(&self) -> Result<InventorySummary, InventoryError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(summary())
        }
    }

    #[tokio::test]
    async fn test_cached_inventory_fetches_once() {
        let provider = Arc::new(CountingInventory(AtomicU32::new(0)));
        let cached = CachedInventory::new(provider.clone(), Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(cached.summary().await.unwrap().tables.len(), 1);
        }
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_file_degrades_to_empty() {
        let cached = CachedInventory::new(
            Arc::new(JsonFileInventory::new("/nonexistent/inventory.json")),
            Duration::from_secs(60),
        );
        assert!(cached.summary().await.is_err());
        assert!(cached.summary_or_empty().await.tables.is_empty());
    }
}
