//! Size-bounded prompt construction and response extraction.

use std::fmt::Write as _;

use crate::analysis::{IntegrationAnalysis, IntegrationStrategy};
use crate::inventory::InventorySummary;
use crate::lang::TargetLanguage;
use crate::recommendations::Recommendation;
use crate::structure::FileMapping;
use crate::text::truncate_chars;

const MAX_INVENTORY_TABLES: usize = 25;

/// Builds prompts that never exceed `max_chars` in total.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    language: TargetLanguage,
    max_chars: usize,
}

impl PromptBuilder {
    pub fn new(language: TargetLanguage, max_chars: usize) -> Self {
        Self { language, max_chars }
    }

    pub fn code_system(&self) -> String {
        format!(
            "You are a senior {lang} engineer integrating a new feature into an existing codebase. \
             Reply with the complete contents of a single {lang} source file in one fenced code block. \
             Do not include explanations.",
            lang = self.language
        )
    }

    pub fn test_system(&self) -> String {
        format!(
            "You write focused, deterministic {lang} unit tests. Reply with one complete {lang} test \
             file in a single fenced code block. Tests must not use the network.",
            lang = self.language
        )
    }

    /// Prompt for the implementation. `feedback` carries validation failures
    /// from earlier attempts and is never dropped to fit the bound.
    pub fn code_prompt(
        &self,
        rec: &Recommendation,
        mapping: &FileMapping,
        analysis: &IntegrationAnalysis,
        inventory: &InventorySummary,
        feedback: &[String],
    ) -> String {
        let mut head = String::new();
        let _ = writeln!(head, "## Task\nImplement recommendation `{}`: {}", rec.id, rec.title);
        let _ = writeln!(head, "\n{}", rec.description.trim());
        if !rec.integration_hints.is_empty() {
            let _ = writeln!(head, "\nIntegration hints:");
            for hint in &rec.integration_hints {
                let _ = writeln!(head, "- {hint}");
            }
        }
        let _ = writeln!(
            head,
            "\nTarget file: `{}` (strategy: {})",
            mapping.relative_path.display(),
            strategy_instructions(analysis.integration_strategy)
        );
        if analysis.integration_strategy.preserves_existing()
            && !analysis.existing_top_level_symbols.is_empty()
        {
            let _ = writeln!(
                head,
                "The file must keep defining: {}",
                analysis.existing_top_level_symbols.join(", ")
            );
        }

        let mut tail = String::new();
        if !feedback.is_empty() {
            let _ = writeln!(tail, "\n## Problems with the previous attempt");
            for item in feedback {
                let _ = writeln!(tail, "- {item}");
            }
        }

        let mut optional: Vec<String> = Vec::new();
        if let Some(source) = analysis
            .existing_source
            .as_deref()
            .filter(|_| analysis.integration_strategy.preserves_existing())
        {
            optional.push(format!(
                "\n## Current contents of the target file\n```{}\n{}\n```\n",
                self.language.fence_tags()[0],
                source
            ));
        }
        if !analysis.dataset_references.is_empty() {
            let mut section = String::from("\n## Datasets to use\n");
            for reference in &analysis.dataset_references {
                let _ = writeln!(
                    section,
                    "- {} ({} rows): columns {}",
                    reference.table,
                    reference.record_count,
                    reference.columns.join(", ")
                );
                if !reference.missing_columns.is_empty() {
                    let _ = writeln!(
                        section,
                        "  unavailable columns: {}",
                        reference.missing_columns.join(", ")
                    );
                }
            }
            optional.push(section);
        }
        if !analysis.required_imports.is_empty() {
            optional.push(format!(
                "\n## Imports used by neighboring modules\n{}\n",
                analysis.required_imports.join("\n")
            ));
        }
        if !analysis.similar_existing_symbols.is_empty() {
            let mut section =
                String::from("\n## Existing code to reuse rather than duplicate\n");
            for symbol in &analysis.similar_existing_symbols {
                let _ = writeln!(
                    section,
                    "- {}:{} {}",
                    symbol.file.display(),
                    symbol.line,
                    symbol.signature
                );
            }
            optional.push(section);
        }
        if !inventory.tables.is_empty() && analysis.dataset_references.is_empty() {
            optional.push(format!(
                "\n## Available datasets\n{}\n",
                inventory.render_compact(MAX_INVENTORY_TABLES)
            ));
        }

        self.assemble(head, optional, tail)
    }

    /// Prompt for tests exercising `source`, importable as `module`.
    pub fn test_prompt(
        &self,
        rec: &Recommendation,
        source: &str,
        module_path: &str,
        feedback: &[String],
    ) -> String {
        let mut head = String::new();
        let _ = writeln!(
            head,
            "## Task\nWrite unit tests for recommendation `{}`: {}\n",
            rec.id, rec.title
        );
        let _ = writeln!(head, "The code under test lives at `{module_path}`.");
        match self.language {
            TargetLanguage::Python => {
                let _ = writeln!(head, "Use pytest. Import the module by its dotted path.");
            }
            TargetLanguage::Rust => {
                let _ = writeln!(head, "Write an integration test file using #[test] functions.");
            }
        }

        let mut tail = String::new();
        if !feedback.is_empty() {
            let _ = writeln!(tail, "\n## Problems with the previous attempt");
            for item in feedback {
                let _ = writeln!(tail, "- {item}");
            }
        }

        let optional = vec![format!(
            "\n## Code under test\n```{}\n{}\n```\n",
            self.language.fence_tags()[0],
            source
        )];
        self.assemble(head, optional, tail)
    }

    /// `head` and `tail` are kept whole; optional sections are added in order
    /// and truncated to whatever budget remains.
    fn assemble(&self, head: String, optional: Vec<String>, tail: String) -> String {
        let fixed = head.chars().count() + tail.chars().count();
        let mut budget = self.max_chars.saturating_sub(fixed);
        let mut prompt = head;
        for section in optional {
            if budget < 64 {
                break;
            }
            let piece = truncate_chars(&section, budget);
            budget -= piece.chars().count();
            prompt.push_str(&piece);
        }
        prompt.push_str(&tail);
        truncate_chars(&prompt, self.max_chars)
    }
}

fn strategy_instructions(strategy: IntegrationStrategy) -> &'static str {
    match strategy {
        IntegrationStrategy::NewFile => "create a new file",
        IntegrationStrategy::ExtendExisting => {
            "extend the existing file, returning all of it with the new code added"
        }
        IntegrationStrategy::Replace => {
            "rewrite the closest existing implementation in place, returning the whole file"
        }
    }
}

/// Pull source out of a model response. With several fenced blocks, the
/// first one tagged with the target language wins, then the first block of
/// any tag. A response without fences is returned trimmed.
pub fn extract_code(response: &str, language: TargetLanguage) -> String {
    let mut blocks: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in response.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None => {
                if let Some(tag) = trimmed.strip_prefix("```") {
                    let tag = tag.split_whitespace().next().unwrap_or("").to_lowercase();
                    current = Some((tag, Vec::new()));
                }
            }
            Some((tag, body)) => {
                if trimmed.starts_with("```") {
                    blocks.push((tag, body.join("\n")));
                } else {
                    let mut body = body;
                    body.push(line);
                    current = Some((tag, body));
                }
            }
        }
    }
    // unterminated trailing fence: keep what was streamed
    if let Some((tag, body)) = current {
        blocks.push((tag, body.join("\n")));
    }

    let chosen = blocks
        .iter()
        .find(|(tag, _)| language.fence_tags().contains(&tag.as_str()))
        .or_else(|| blocks.first())
        .map(|(_, body)| body.as_str());

    let mut code = chosen.unwrap_or(response).trim_matches('\n').to_string();
    if !code.ends_with('\n') {
        code.push('\n');
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SimilarSymbol;
    use crate::inventory::DatasetReference;
    use crate::lang::SymbolKind;
    use crate::priority::Priority;
    use crate::recommendations::DataRequirements;
    use std::path::PathBuf;

    fn rec() -> Recommendation {
        Recommendation {
            id: "r1".into(),
            title: "Add FG% calc".into(),
            description: "Compute field goal percentage".into(),
            category: "analytics".into(),
            priority: Priority::High,
            data_requirements: DataRequirements::default(),
            integration_hints: vec!["reuse load_games".into()],
            dependencies: vec![],
        }
    }

    fn mapping() -> FileMapping {
        FileMapping {
            relative_path: PathBuf::from("src/analytics/add_fg_calc.py"),
            category: None,
            confidence: 1.0,
            existing_file: false,
            renamed_from: None,
        }
    }

    fn analysis(strategy: IntegrationStrategy, existing: Option<&str>) -> IntegrationAnalysis {
        IntegrationAnalysis {
            candidate_file_path: PathBuf::from("src/analytics/add_fg_calc.py"),
            integration_strategy: strategy,
            similar_existing_symbols: vec![SimilarSymbol {
                name: "field_goal_ratio".into(),
                kind: SymbolKind::Function,
                file: PathBuf::from("src/analytics/shooting.py"),
                line: 4,
                score: 0.4,
                signature: "def field_goal_ratio(df):".into(),
            }],
            required_imports: vec!["import pandas as pd".into()],
            conflict_flag: false,
            existing_top_level_symbols: vec!["helper".into()],
            existing_source: existing.map(str::to_string),
            dataset_references: vec![DatasetReference {
                table: "games".into(),
                columns: vec!["fgm".into(), "fga".into()],
                missing_columns: vec![],
                record_count: 100,
                date_coverage: None,
                covers_requested_range: None,
            }],
            unknown_tables: vec![],
        }
    }

    #[test]
    fn test_code_prompt_contains_context() {
        let builder = PromptBuilder::new(TargetLanguage::Python, 10_000);
        let prompt = builder.code_prompt(
            &rec(),
            &mapping(),
            &analysis(IntegrationStrategy::NewFile, None),
            &InventorySummary::default(),
            &[],
        );
        assert!(prompt.contains("Implement recommendation `r1`"));
        assert!(prompt.contains("reuse load_games"));
        assert!(prompt.contains("games (100 rows): columns fgm, fga"));
        assert!(prompt.contains("def field_goal_ratio(df):"));
        assert!(!prompt.contains("must keep defining"));
    }

    #[test]
    fn test_extend_prompt_includes_existing_source_and_symbols() {
        let builder = PromptBuilder::new(TargetLanguage::Python, 10_000);
        let prompt = builder.code_prompt(
            &rec(),
            &mapping(),
            &analysis(IntegrationStrategy::ExtendExisting, Some("def helper():\n    pass\n")),
            &InventorySummary::default(),
            &["syntax error at line 3".into()],
        );
        assert!(prompt.contains("must keep defining: helper"));
        assert!(prompt.contains("def helper():"));
        assert!(prompt.contains("syntax error at line 3"));
    }

    #[test]
    fn test_prompt_is_bounded_and_keeps_feedback() {
        let builder = PromptBuilder::new(TargetLanguage::Python, 600);
        let huge = "x = 1\n".repeat(5_000);
        let prompt = builder.code_prompt(
            &rec(),
            &mapping(),
            &analysis(IntegrationStrategy::ExtendExisting, Some(&huge)),
            &InventorySummary::default(),
            &["missing symbol helper".into()],
        );
        assert!(prompt.chars().count() <= 600);
        assert!(prompt.contains("missing symbol helper"));
    }

    #[test]
    fn test_extract_prefers_language_fence() {
        let response = "Here you go:\n```text\nnot code\n```\n```python\ndef f():\n    return 1\n```\n";
        assert_eq!(extract_code(response, TargetLanguage::Python), "def f():\n    return 1\n");
    }

    #[test]
    fn test_extract_falls_back_to_first_fence_or_raw() {
        assert_eq!(extract_code("```\na = 1\n```", TargetLanguage::Python), "a = 1\n");
        assert_eq!(extract_code("\n\nb = 2", TargetLanguage::Python), "b = 2\n");
        assert_eq!(
            extract_code("```rust\nfn main() {}\n", TargetLanguage::Rust),
            "fn main() {}\n"
        );
    }
}
