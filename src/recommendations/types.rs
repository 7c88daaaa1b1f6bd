use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::priority::Priority;

/// A structured feature recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data_requirements: DataRequirements,
    #[serde(default)]
    pub integration_hints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Datasets a recommendation needs.
///
/// `columns` may be bare (`"fg_pct"`) or table-qualified (`"games.fg_pct"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequirements {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DataRequirements {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.columns.is_empty() && self.date_range.is_none()
    }

    /// Columns requested for `table`: qualified columns naming that table plus
    /// every unqualified column.
    pub fn columns_for(&self, table: &str) -> Vec<String> {
        self.columns
            .iter()
            .filter_map(|col| match col.split_once('.') {
                Some((t, c)) if t.eq_ignore_ascii_case(table) => Some(c.to_string()),
                Some(_) => None,
                None => Some(col.clone()),
            })
            .collect()
    }
}

impl Recommendation {
    /// Text used for keyword matching and similarity scoring.
    pub fn search_text(&self) -> String {
        let mut text = format!("{} {} {}", self.title, self.description, self.category);
        for hint in &self.integration_hints {
            text.push(' ');
            text.push_str(hint);
        }
        text
    }
}
