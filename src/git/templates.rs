//! Commit message and pull request templates.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::analysis::IntegrationAnalysis;
use crate::recommendations::Recommendation;

/// Test results as reported in commits and pull requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestSummary {
    pub passed: u32,
    pub executed: u32,
    pub pass_rate: f64,
    pub threshold: f64,
}

impl TestSummary {
    pub fn meets_threshold(&self) -> bool {
        self.pass_rate >= self.threshold
    }

    fn line(&self) -> String {
        let mut line = format!(
            "{}/{} passed (pass rate {:.2}, threshold {:.2})",
            self.passed, self.executed, self.pass_rate, self.threshold
        );
        if !self.meets_threshold() {
            line.push_str(" - below threshold, not pushed");
        }
        line
    }
}

fn scope(rec: &Recommendation) -> String {
    let scope: String = rec
        .category
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if scope.is_empty() {
        "recommendation".into()
    } else {
        scope
    }
}

pub fn commit_message(rec: &Recommendation, files: &[PathBuf], tests: Option<&TestSummary>) -> String {
    let mut msg = format!("feat({}): {}\n\n", scope(rec), rec.title.trim());
    let _ = writeln!(
        msg,
        "Implements recommendation {} ({} priority).",
        rec.id,
        rec.priority.as_str()
    );
    if !files.is_empty() {
        let _ = writeln!(msg, "\nFiles:");
        for file in files {
            let _ = writeln!(msg, "- {}", file.display());
        }
    }
    match tests {
        Some(summary) => {
            let _ = writeln!(msg, "\nTests: {}", summary.line());
        }
        None => {
            let _ = writeln!(msg, "\nTests: not run");
        }
    }
    let _ = write!(msg, "\nRecommendation-Id: {}\n", rec.id);
    msg
}

pub fn pull_request_title(rec: &Recommendation) -> String {
    format!("[{}] {}", rec.id, rec.title.trim())
}

pub fn pull_request_body(
    rec: &Recommendation,
    analysis: &IntegrationAnalysis,
    tests: Option<&TestSummary>,
) -> String {
    let mut body = String::from("## Summary\n\n");
    let _ = writeln!(body, "{}\n", rec.description.trim());
    let _ = writeln!(
        body,
        "- Recommendation: `{}` ({} priority)",
        rec.id,
        rec.priority.as_str()
    );
    let _ = writeln!(
        body,
        "- Target: `{}` ({:?})",
        analysis.candidate_file_path.display(),
        analysis.integration_strategy
    );

    let _ = writeln!(body, "\n## Referenced datasets\n");
    if analysis.dataset_references.is_empty() {
        let _ = writeln!(body, "None.");
    } else {
        for reference in &analysis.dataset_references {
            let _ = writeln!(
                body,
                "- `{}` ({} rows): {}",
                reference.table,
                reference.record_count,
                reference.columns.join(", ")
            );
        }
    }
    if !analysis.unknown_tables.is_empty() {
        let _ = writeln!(
            body,
            "\nNot found in the data inventory: {}",
            analysis.unknown_tables.join(", ")
        );
    }

    let _ = writeln!(body, "\n## Test results\n");
    match tests {
        Some(summary) => {
            let _ = writeln!(body, "{}", summary.line());
        }
        None => {
            let _ = writeln!(body, "Tests were not run.");
        }
    }

    let _ = write!(
        body,
        "\n---\nGenerated automatically from recommendation `{}`. Review before merging.\n",
        rec.id
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::IntegrationStrategy;
    use crate::inventory::DatasetReference;
    use crate::priority::Priority;
    use crate::recommendations::DataRequirements;

    fn rec() -> Recommendation {
        Recommendation {
            id: "r1".into(),
            title: "Add FG% calc".into(),
            description: "Compute field goal percentage.".into(),
            category: "Data Processing".into(),
            priority: Priority::High,
            data_requirements: DataRequirements::default(),
            integration_hints: vec![],
            dependencies: vec![],
        }
    }

    fn summary(passed: u32, executed: u32) -> TestSummary {
        TestSummary {
            passed,
            executed,
            pass_rate: f64::from(passed) / f64::from(executed),
            threshold: 0.9,
        }
    }

    #[test]
    fn test_commit_message_references_recommendation() {
        let msg = commit_message(&rec(), &[PathBuf::from("src/a.py")], Some(&summary(10, 10)));
        assert!(msg.starts_with("feat(data-processing): Add FG% calc\n"));
        assert!(msg.contains("Implements recommendation r1 (high priority)."));
        assert!(msg.contains("- src/a.py"));
        assert!(msg.contains("10/10 passed (pass rate 1.00"));
        assert!(msg.contains("Recommendation-Id: r1"));
        assert!(!msg.contains("not pushed"));
    }

    #[test]
    fn test_commit_message_flags_low_pass_rate() {
        let msg = commit_message(&rec(), &[], Some(&summary(8, 10)));
        assert!(msg.contains("below threshold, not pushed"));
    }

    #[test]
    fn test_pull_request_body_sections() {
        let analysis = IntegrationAnalysis {
            candidate_file_path: PathBuf::from("src/analytics/add_fg_calc.py"),
            integration_strategy: IntegrationStrategy::NewFile,
            similar_existing_symbols: vec![],
            required_imports: vec![],
            conflict_flag: false,
            existing_top_level_symbols: vec![],
            existing_source: None,
            dataset_references: vec![DatasetReference {
                table: "games".into(),
                columns: vec!["fgm".into()],
                missing_columns: vec![],
                record_count: 5,
                date_coverage: None,
                covers_requested_range: None,
            }],
            unknown_tables: vec!["tracking".into()],
        };
        let body = pull_request_body(&rec(), &analysis, Some(&summary(10, 10)));
        assert!(body.contains("## Summary"));
        assert!(body.contains("`games` (5 rows): fgm"));
        assert!(body.contains("Not found in the data inventory: tracking"));
        assert!(body.contains("10/10 passed"));
        assert_eq!(pull_request_title(&rec()), "[r1] Add FG% calc");
    }
}
