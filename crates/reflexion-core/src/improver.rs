//! Instruction revision between attempts.
//!
//! The prompt handed to the generator is a bounded delta: the latest
//! critique plus the top-k mined patterns, both truncated. History never
//! accumulates across attempts; each revision starts from the original
//! instructions.

use std::sync::Arc;
use tracing::{debug, warn};

use reflexion_proxy::{CallConfig, InstructionGenerator};
use reflexion_review::Critique;
use reflexion_store::Pattern;

const MAX_CRITIQUE_CHARS: usize = 2_000;
const MAX_INSTRUCTION_CHARS: usize = 8_000;

/// Revised instructions plus how they were produced
#[derive(Debug, Clone)]
pub struct RevisedInstructions {
    pub text: String,
    /// True when the generator failed and the templated amendment was used
    pub fallback: bool,
}

pub struct Improver {
    generator: Option<Arc<dyn InstructionGenerator>>,
    pattern_top_k: usize,
}

impl Improver {
    pub fn new(generator: Option<Arc<dyn InstructionGenerator>>, pattern_top_k: usize) -> Self {
        Self {
            generator,
            pattern_top_k,
        }
    }

    /// Produce instructions for the next attempt from the original
    /// instructions, the latest critique, and mined patterns. Pure with
    /// respect to the store. Generation failure falls back to a templated
    /// amendment that appends the critique verbatim.
    pub async fn revise(
        &self,
        original: &str,
        critique: &Critique,
        patterns: &[Pattern],
        config: &CallConfig,
    ) -> RevisedInstructions {
        let notes = self.pattern_notes(patterns);

        if let Some(ref generator) = self.generator {
            let bounded_critique = truncate(&critique.as_feedback(), MAX_CRITIQUE_CHARS);
            let bounded_original = truncate(original, MAX_INSTRUCTION_CHARS);
            match generator
                .generate(&bounded_original, &bounded_critique, &notes, config)
                .await
            {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(generator = generator.name(), "Instructions revised");
                    return RevisedInstructions {
                        text,
                        fallback: false,
                    };
                }
                Ok(_) => {
                    warn!(
                        generator = generator.name(),
                        "Generator returned empty instructions, using fallback"
                    );
                }
                Err(e) => {
                    warn!(
                        generator = generator.name(),
                        error = %e,
                        "Generator failed, using fallback"
                    );
                }
            }
        }

        RevisedInstructions {
            text: Self::templated_amendment(original, critique, &notes),
            fallback: true,
        }
    }

    /// Fold a challenge resolution's rationale into the instructions as a
    /// clarification for the next attempt.
    pub fn fold_clarification(&self, instructions: &str, rationale: &str) -> String {
        format!(
            "{}\n\n## Clarification from dispute resolution\n\n{}\n",
            instructions.trim_end(),
            rationale.trim()
        )
    }

    fn pattern_notes(&self, patterns: &[Pattern]) -> Vec<String> {
        patterns
            .iter()
            .take(self.pattern_top_k)
            .map(|p| {
                format!(
                    "Recurring review finding: {} (weighted frequency {:.2}, last seen {})",
                    p.category,
                    p.frequency,
                    p.last_seen.format("%Y-%m-%d")
                )
            })
            .collect()
    }

    fn templated_amendment(original: &str, critique: &Critique, notes: &[String]) -> String {
        let mut text = format!(
            "{}\n\n## Address this review feedback\n\n{}\n",
            original.trim_end(),
            critique.as_feedback()
        );
        if !notes.is_empty() {
            text.push_str("\n## Watch for these recurring findings\n\n");
            for note in notes {
                text.push_str("- ");
                text.push_str(note);
                text.push('\n');
            }
        }
        text
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{}\n[truncated]", cut)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reflexion_proxy::ProxyError;
    use reflexion_review::{CritiqueCategory, Severity};

    struct FailingGenerator;

    #[async_trait]
    impl InstructionGenerator for FailingGenerator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(
            &self,
            _base: &str,
            _critique: &str,
            _notes: &[String],
            _config: &CallConfig,
        ) -> Result<String, ProxyError> {
            Err(ProxyError::Unavailable("down".into()))
        }
    }

    fn critique() -> Critique {
        Critique {
            id: "c-1".into(),
            attempt_id: "a-1".into(),
            category: CritiqueCategory::ImplementationDefect,
            severity: Severity::Major,
            claim: "off by one in pagination".into(),
            detail: "The last page is skipped.".into(),
            suggestion: Some("use an inclusive bound".into()),
        }
    }

    #[tokio::test]
    async fn generator_failure_falls_back_to_template_with_critique_verbatim() {
        let improver = Improver::new(Some(Arc::new(FailingGenerator)), 3);
        let revised = improver
            .revise("Write the pager.", &critique(), &[], &CallConfig::default())
            .await;
        assert!(revised.fallback);
        assert!(revised.text.starts_with("Write the pager."));
        assert!(revised.text.contains("off by one in pagination"));
        assert!(revised.text.contains("use an inclusive bound"));
    }

    #[tokio::test]
    async fn no_generator_always_uses_template() {
        let improver = Improver::new(None, 3);
        let revised = improver
            .revise("Do the thing.", &critique(), &[], &CallConfig::default())
            .await;
        assert!(revised.fallback);
        assert!(revised.text.contains("Address this review feedback"));
    }

    #[test]
    fn clarification_is_appended_as_its_own_section() {
        let improver = Improver::new(None, 3);
        let folded = improver.fold_clarification("Base.", "Criterion C-2 means the API surface.");
        assert!(folded.contains("Clarification from dispute resolution"));
        assert!(folded.contains("Criterion C-2 means the API surface."));
    }
}
