use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::capability::{CapabilityError, CodeGenerator, GenerationRequest};
use super::prompt::{extract_code, PromptBuilder};
use crate::analysis::IntegrationAnalysis;
use crate::error::DeploymentError;
use crate::inventory::InventorySummary;
use crate::lang::{parse_source, syntax_check, TargetLanguage};
use crate::recommendations::Recommendation;
use crate::structure::{provenance_marker, FileMapping};

/// Generated source for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub source: String,
    pub target_path: PathBuf,
    pub syntax_valid: bool,
    pub generation_attempts: u32,
}

/// Generated tests for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestArtifact {
    pub source: String,
    pub target_path: PathBuf,
    pub syntax_valid: bool,
    pub generation_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ImplementerSettings {
    pub language: TargetLanguage,
    pub max_attempts: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_prompt_chars: usize,
}

impl Default for ImplementerSettings {
    fn default() -> Self {
        Self {
            language: TargetLanguage::Python,
            max_attempts: 3,
            temperature: 0.1,
            max_output_tokens: 4096,
            max_prompt_chars: 24_000,
        }
    }
}

/// Drives the code-generation capability until it yields source that parses
/// and keeps the symbols an existing file already defined.
pub struct AiCodeImplementer {
    generator: Arc<dyn CodeGenerator>,
    prompts: PromptBuilder,
    settings: ImplementerSettings,
}

impl AiCodeImplementer {
    pub fn new(generator: Arc<dyn CodeGenerator>, settings: ImplementerSettings) -> Self {
        // leave room for the system prompt inside the backend's bound
        let prompts = PromptBuilder::new(settings.language, settings.max_prompt_chars.saturating_sub(600));
        Self {
            generator,
            prompts,
            settings,
        }
    }

    #[instrument(skip_all, fields(recommendation.id = %rec.id))]
    pub async fn implement(
        &self,
        rec: &Recommendation,
        mapping: &FileMapping,
        analysis: &IntegrationAnalysis,
        inventory: &InventorySummary,
        cancel: &CancellationToken,
    ) -> Result<CodeArtifact, DeploymentError> {
        let mut feedback: Vec<String> = Vec::new();
        let mut last_problem = String::from("no attempt made");
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(DeploymentError::Cancelled);
            }

            let request = GenerationRequest {
                system: self.prompts.code_system(),
                prompt: self.prompts.code_prompt(rec, mapping, analysis, inventory, &feedback),
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_output_tokens,
            };

            let response = match self.generator.generate_code(&request, cancel).await {
                Ok(response) => response,
                Err(CapabilityError::Cancelled) => return Err(DeploymentError::Cancelled),
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Code generation call failed");
                    last_problem = e.to_string();
                    continue;
                }
                Err(e) => {
                    return Err(DeploymentError::Generation {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            };

            let source = with_provenance(
                extract_code(&response, self.settings.language),
                &rec.id,
                self.settings.language,
            );

            if let Err(issue) = syntax_check(&source, self.settings.language) {
                warn!(attempt, error = %issue, "Generated code failed to parse");
                last_problem = issue.to_string();
                feedback.push(format!("The code did not parse: {issue}"));
                continue;
            }

            if analysis.integration_strategy.preserves_existing() {
                let missing = missing_symbols(&source, &analysis.existing_top_level_symbols, self.settings.language);
                if !missing.is_empty() {
                    warn!(attempt, missing = ?missing, "Generated code dropped existing definitions");
                    last_problem = format!("dropped existing definitions: {}", missing.join(", "));
                    feedback.push(format!(
                        "The file no longer defines {}; keep every existing definition.",
                        missing.join(", ")
                    ));
                    continue;
                }
            }

            info!(attempt, chars = source.len(), "Generated code accepted");
            return Ok(CodeArtifact {
                source,
                target_path: mapping.relative_path.clone(),
                syntax_valid: true,
                generation_attempts: attempt,
            });
        }

        Err(DeploymentError::Generation {
            attempts: max_attempts,
            reason: last_problem,
        })
    }
}

/// Prefix the provenance header unless the source already carries it.
pub fn with_provenance(source: String, recommendation_id: &str, language: TargetLanguage) -> String {
    let marker = provenance_marker(recommendation_id);
    if source.contains(&marker) {
        return source;
    }
    format!("{} {marker}\n{source}", language.line_comment())
}

fn missing_symbols(source: &str, required: &[String], language: TargetLanguage) -> Vec<String> {
    let defined = match parse_source(source, language) {
        Ok(parsed) => parsed
            .top_level_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    required
        .iter()
        .filter(|name| !defined.contains(name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::IntegrationStrategy;
    use crate::generation::capability::MockCodeGenerator;
    use crate::priority::Priority;
    use crate::recommendations::DataRequirements;
    use mockall::Sequence;
    use std::time::Duration;

    fn rec() -> Recommendation {
        Recommendation {
            id: "r1".into(),
            title: "Add FG% calc".into(),
            description: "Compute field goal percentage".into(),
            category: "analytics".into(),
            priority: Priority::Normal,
            data_requirements: DataRequirements::default(),
            integration_hints: vec![],
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

    fn analysis(strategy: IntegrationStrategy, existing: &[&str]) -> IntegrationAnalysis {
        IntegrationAnalysis {
            candidate_file_path: PathBuf::from("src/analytics/add_fg_calc.py"),
            integration_strategy: strategy,
            similar_existing_symbols: vec![],
            required_imports: vec![],
            conflict_flag: false,
            existing_top_level_symbols: existing.iter().map(|s| s.to_string()).collect(),
            existing_source: None,
            dataset_references: vec![],
            unknown_tables: vec![],
        }
    }

    fn implementer(mock: MockCodeGenerator, attempts: u32) -> AiCodeImplementer {
        AiCodeImplementer::new(
            Arc::new(mock),
            ImplementerSettings {
                max_attempts: attempts,
                ..ImplementerSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_valid_code_first_attempt() {
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code()
            .times(1)
            .returning(|req, _| {
                assert!((req.temperature - 0.1).abs() < f32::EPSILON);
                Ok("```python\ndef fg_pct(made, att):\n    return made / att\n```".into())
            });

        let artifact = implementer(mock, 3)
            .implement(&rec(), &mapping(), &analysis(IntegrationStrategy::NewFile, &[]), &InventorySummary::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.generation_attempts, 1);
        assert!(artifact.syntax_valid);
        assert!(artifact.source.starts_with("# Recommendation: r1\n"));
    }

    #[tokio::test]
    async fn test_parse_error_is_fed_back() {
        let mut seq = Sequence::new();
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("def broken(:\n".into()));
        mock.expect_generate_code()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req, _| req.prompt.contains("did not parse"))
            .returning(|_, _| Ok("def fixed():\n    return 1\n".into()));

        let artifact = implementer(mock, 3)
            .implement(&rec(), &mapping(), &analysis(IntegrationStrategy::NewFile, &[]), &InventorySummary::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.generation_attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code()
            .times(2)
            .returning(|_, _| Ok("class (:".into()));

        let err = implementer(mock, 2)
            .implement(&rec(), &mapping(), &analysis(IntegrationStrategy::NewFile, &[]), &InventorySummary::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Generation { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_dropped_symbols_trigger_retry() {
        let mut seq = Sequence::new();
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("def fg_pct():\n    return 1\n".into()));
        mock.expect_generate_code()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req, _| req.prompt.contains("no longer defines helper"))
            .returning(|_, _| Ok("def helper():\n    pass\n\ndef fg_pct():\n    return 1\n".into()));

        let artifact = implementer(mock, 3)
            .implement(
                &rec(),
                &mapping(),
                &analysis(IntegrationStrategy::ExtendExisting, &["helper"]),
                &InventorySummary::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(artifact.source.contains("def helper"));
        assert_eq!(artifact.generation_attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_errors_consume_attempts() {
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code()
            .times(3)
            .returning(|_, _| Err(CapabilityError::Timeout(Duration::from_secs(1))));

        let err = implementer(mock, 3)
            .implement(&rec(), &mapping(), &analysis(IntegrationStrategy::NewFile, &[]), &InventorySummary::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DeploymentError::Generation { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_generation() {
        let mut mock = MockCodeGenerator::new();
        mock.expect_generate_code().times(0);
        let token = CancellationToken::new();
        token.cancel();

        let err = implementer(mock, 3)
            .implement(&rec(), &mapping(), &analysis(IntegrationStrategy::NewFile, &[]), &InventorySummary::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Cancelled));
    }

    #[test]
    fn test_provenance_not_duplicated() {
        let once = with_provenance("x = 1\n".into(), "r1", TargetLanguage::Python);
        let twice = with_provenance(once.clone(), "r1", TargetLanguage::Python);
        assert_eq!(once, twice);
        assert_eq!(
            with_provenance("fn a() {}\n".into(), "r2", TargetLanguage::Rust),
            "// Recommendation: r2\nfn a() {}\n"
        );
    }
}
