use reflexion_proxy::Artifact;

/// Prompt templates for the reviewer
pub struct ReviewPrompts;

impl ReviewPrompts {
    /// Build the reviewer evaluation prompt
    pub fn build_evaluation_prompt(criteria: &[String], artifact: &Artifact) -> String {
        let criteria_block = if criteria.is_empty() {
            "- (none stated; judge fitness for purpose)".to_string()
        } else {
            criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"You are a rigorous reviewer. Judge the artifact below strictly against the acceptance criteria.

## Acceptance criteria
{criteria}

## Artifact
```
{artifact}
```

---

Classify any failure precisely:
- `requirement_gap`: a stated criterion is not addressed at all.
- `implementation_defect`: a criterion is addressed but incorrectly.
- `ambiguity_suspected`: the instructions themselves can be read two ways; the artifact may be right under one reading.
- `style_only`: cosmetic issues only.

Severity is `critical`, `major` or `minor`. An artifact with only minor style findings should be accepted.

End your review with exactly one verdict block:

<verdict>
{{"type": "accepted", "summary": "<why it passes>"}}
</verdict>

or

<verdict>
{{"type": "rejected", "criterion_id": "<id or null>", "critique": {{"category": "<category>", "severity": "<severity>", "claim": "<one-line finding>", "detail": "<full explanation>", "suggestion": "<how to fix>"}}}}
</verdict>
"#,
            criteria = criteria_block,
            artifact = artifact.content,
        )
    }
}
