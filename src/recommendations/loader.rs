use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{DataRequirements, DateRange, Recommendation};
use crate::priority::Priority;

/// Per-record validation failure. Never fatal to a batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("record {index}: missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("record {index}: field `{field}` is invalid: {reason}")]
    InvalidField {
        index: usize,
        field: String,
        reason: String,
    },
    #[error("record {index}: duplicate recommendation id `{id}`")]
    DuplicateId { index: usize, id: String },
    #[error("record {index}: expected an object, found {found}")]
    NotAnObject { index: usize, found: String },
    #[error("record {index}: {reason}")]
    Malformed { index: usize, reason: String },
}

/// Failure to read the input as a whole. Aborts the run before any item.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read recommendations from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse recommendations from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported recommendations document in {path}: {reason}")]
    Shape { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub index: usize,
    /// The id if the record carried a usable one
    pub id: Option<String>,
    pub error: ValidationError,
}

impl RejectedRecord {
    /// Identifier used in reports when the record had no id.
    pub fn report_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("record-{}", self.index))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub valid: Vec<Recommendation>,
    pub rejected: Vec<RejectedRecord>,
}

impl LoadOutcome {
    pub fn total(&self) -> usize {
        self.valid.len() + self.rejected.len()
    }

    pub fn find(&self, id: &str) -> Option<&Recommendation> {
        self.valid.iter().find(|r| r.id == id)
    }
}

/// Parses and validates recommendation records.
#[derive(Debug, Default, Clone)]
pub struct RecommendationLoader;

impl RecommendationLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a JSON array, a `{"recommendations": [...]}` document, or JSON
    /// Lines (one record per line, `.jsonl` extension).
    pub async fn load_file(&self, path: &Path) -> Result<LoadOutcome, LoadError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_jsonl = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);

        let records = if is_jsonl {
            let mut records = Vec::new();
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let value: Value =
                    serde_json::from_str(line).map_err(|source| LoadError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                records.push(value);
            }
            records
        } else {
            let document: Value =
                serde_json::from_str(&raw).map_err(|source| LoadError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            Self::extract_records(document).map_err(|reason| LoadError::Shape {
                path: path.to_path_buf(),
                reason,
            })?
        };

        let outcome = self.load_values(records);
        info!(
            path = %path.display(),
            valid = outcome.valid.len(),
            rejected = outcome.rejected.len(),
            "Loaded recommendations"
        );
        Ok(outcome)
    }

    fn extract_records(document: Value) -> Result<Vec<Value>, String> {
        match document {
            Value::Array(items) => Ok(items),
            Value::Object(mut map) => match map.remove("recommendations") {
                Some(Value::Array(items)) => Ok(items),
                Some(other) => Err(format!(
                    "`recommendations` must be an array, found {}",
                    value_kind(&other)
                )),
                None if map.contains_key("id") => Ok(vec![Value::Object(map)]),
                None => Err("expected an array or an object with a `recommendations` array".into()),
            },
            other => Err(format!("expected an array, found {}", value_kind(&other))),
        }
    }

    /// Validate already-parsed records. Malformed records are excluded from
    /// `valid` and reported in `rejected`.
    pub fn load_values(&self, records: Vec<Value>) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let mut seen = HashSet::new();

        for (index, value) in records.into_iter().enumerate() {
            let id_hint = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            match self.validate_record(index, &value) {
                Ok(rec) => {
                    if !seen.insert(rec.id.clone()) {
                        warn!(id = %rec.id, index, "Duplicate recommendation id");
                        outcome.rejected.push(RejectedRecord {
                            index,
                            id: Some(rec.id.clone()),
                            error: ValidationError::DuplicateId { index, id: rec.id },
                        });
                        continue;
                    }
                    debug!(id = %rec.id, "Recommendation validated");
                    outcome.valid.push(rec);
                }
                Err(error) => {
                    warn!(index, error = %error, "Rejected malformed recommendation");
                    outcome.rejected.push(RejectedRecord {
                        index,
                        id: id_hint,
                        error,
                    });
                }
            }
        }

        outcome
    }

    pub fn validate_record(
        &self,
        index: usize,
        value: &Value,
    ) -> Result<Recommendation, ValidationError> {
        let obj = value.as_object().ok_or_else(|| ValidationError::NotAnObject {
            index,
            found: value_kind(value).to_string(),
        })?;

        let id = required_string(obj, index, "id")?;
        if id.chars().any(|c| c.is_control() || c == '/') {
            return Err(ValidationError::InvalidField {
                index,
                field: "id".into(),
                reason: "must not contain control characters or '/'".into(),
            });
        }
        let title = required_string(obj, index, "title")?;
        let description = required_string(obj, index, "description")?;

        let category = optional_string(obj, index, "category")?.unwrap_or_default();
        let priority = match obj.get("priority") {
            None | Some(Value::Null) => Priority::Normal,
            Some(Value::String(s)) => Priority::parse_lenient(s),
            Some(Value::Number(n)) => Priority::parse_lenient(&n.to_string()),
            Some(other) => {
                return Err(ValidationError::InvalidField {
                    index,
                    field: "priority".into(),
                    reason: format!("expected string or number, found {}", value_kind(other)),
                })
            }
        };

        let data_requirements = match obj.get("data_requirements") {
            None | Some(Value::Null) => DataRequirements::default(),
            Some(Value::Object(reqs)) => parse_data_requirements(index, reqs)?,
            Some(other) => {
                return Err(ValidationError::InvalidField {
                    index,
                    field: "data_requirements".into(),
                    reason: format!("expected object, found {}", value_kind(other)),
                })
            }
        };

        let integration_hints = string_or_list(obj, index, "integration_hints")?;
        let dependencies = string_or_list(obj, index, "dependencies")?;
        if dependencies.iter().any(|d| d == &id) {
            return Err(ValidationError::InvalidField {
                index,
                field: "dependencies".into(),
                reason: "a recommendation cannot depend on itself".into(),
            });
        }

        Ok(Recommendation {
            id,
            title,
            description,
            category,
            priority,
            data_requirements,
            integration_hints,
            dependencies,
        })
    }
}

fn parse_data_requirements(
    index: usize,
    reqs: &Map<String, Value>,
) -> Result<DataRequirements, ValidationError> {
    let tables = string_list(reqs, index, "data_requirements.tables", "tables")?;
    let columns = match reqs.get("columns") {
        // {"games": ["fg_pct"]} is flattened into qualified names
        Some(Value::Object(by_table)) => {
            let mut cols = Vec::new();
            for (table, list) in by_table {
                let names = list.as_array().ok_or_else(|| ValidationError::InvalidField {
                    index,
                    field: format!("data_requirements.columns.{table}"),
                    reason: "expected an array of column names".into(),
                })?;
                for name in names {
                    let name = name.as_str().ok_or_else(|| ValidationError::InvalidField {
                        index,
                        field: format!("data_requirements.columns.{table}"),
                        reason: "column names must be strings".into(),
                    })?;
                    cols.push(format!("{table}.{name}"));
                }
            }
            cols
        }
        _ => string_list(reqs, index, "data_requirements.columns", "columns")?,
    };

    let date_range = match reqs.get("date_range") {
        None | Some(Value::Null) => None,
        Some(Value::Object(range)) => {
            let start = parse_date(index, range, "start")?;
            let end = parse_date(index, range, "end")?;
            if start > end {
                return Err(ValidationError::InvalidField {
                    index,
                    field: "data_requirements.date_range".into(),
                    reason: format!("start {start} is after end {end}"),
                });
            }
            Some(DateRange { start, end })
        }
        Some(other) => {
            return Err(ValidationError::InvalidField {
                index,
                field: "data_requirements.date_range".into(),
                reason: format!("expected object with start/end, found {}", value_kind(other)),
            })
        }
    };

    Ok(DataRequirements {
        tables,
        columns,
        date_range,
    })
}

fn parse_date(
    index: usize,
    range: &Map<String, Value>,
    key: &str,
) -> Result<NaiveDate, ValidationError> {
    let field = format!("data_requirements.date_range.{key}");
    let raw = range
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::InvalidField {
            index,
            field: field.clone(),
            reason: "expected a YYYY-MM-DD string".into(),
        })?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| ValidationError::InvalidField {
        index,
        field,
        reason: e.to_string(),
    })
}

fn required_string(
    obj: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField { index, field }),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationError::MissingField { index, field })
        }
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if field == "id" => Ok(n.to_string()),
        Some(other) => Err(ValidationError::InvalidField {
            index,
            field: field.into(),
            reason: format!("expected string, found {}", value_kind(other)),
        }),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    index: usize,
    field: &str,
) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ValidationError::InvalidField {
            index,
            field: field.into(),
            reason: format!("expected string, found {}", value_kind(other)),
        }),
    }
}

fn string_or_list(
    obj: &Map<String, Value>,
    index: usize,
    field: &str,
) -> Result<Vec<String>, ValidationError> {
    match obj.get(field) {
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.trim().to_string()]),
        _ => string_list(obj, index, field, field),
    }
}

fn string_list(
    obj: &Map<String, Value>,
    index: usize,
    field: &str,
    key: &str,
) -> Result<Vec<String>, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(ValidationError::InvalidField {
                    index,
                    field: field.into(),
                    reason: format!("expected strings, found {}", value_kind(other)),
                }),
            })
            .filter(|r| !matches!(r, Ok(s) if s.is_empty()))
            .collect(),
        Some(other) => Err(ValidationError::InvalidField {
            index,
            field: field.into(),
            reason: format!("expected array, found {}", value_kind(other)),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
