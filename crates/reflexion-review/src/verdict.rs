use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{CritiqueCategory, CritiqueDraft, Severity};

/// The reviewer's judgement of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verdict {
    /// The artifact satisfies the acceptance criteria
    Accepted {
        /// Short statement of why it passes
        summary: String,
    },
    /// The artifact does not satisfy the criteria
    Rejected {
        critique: CritiqueDraft,
        /// Which criterion the critique is anchored to, when the reviewer
        /// names one
        #[serde(default)]
        criterion_id: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum VerdictParseError {
    #[error("No verdict marker found in reviewer output")]
    NoVerdictFound,

    #[error("Ambiguous verdict: both accept and reject markers found")]
    AmbiguousVerdict,

    #[error("Failed to parse verdict JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Invalid verdict format: {0}")]
    InvalidFormat(String),
}

impl Verdict {
    /// Parse a verdict from raw reviewer output.
    ///
    /// Expected format:
    /// ```text
    /// <verdict>
    /// {"type": "accepted", "summary": "..."}
    /// </verdict>
    /// ```
    /// or
    /// ```text
    /// <verdict>
    /// {"type": "rejected", "critique": {"category": "implementation_defect",
    ///  "severity": "major", "claim": "...", "detail": "..."}}
    /// </verdict>
    /// ```
    /// Plain `APPROVED` / `REJECTED` markers are accepted as a fallback for
    /// reviewers that do not emit the structured block.
    pub fn parse(reviewer_output: &str) -> Result<Self, VerdictParseError> {
        debug!(output_len = reviewer_output.len(), "Parsing reviewer verdict");

        if let Some(verdict) = Self::parse_verdict_block(reviewer_output)? {
            return Ok(verdict);
        }

        Self::parse_simple_markers(reviewer_output)
    }

    fn parse_verdict_block(output: &str) -> Result<Option<Self>, VerdictParseError> {
        let start = output.find("<verdict>");
        let end = output.find("</verdict>");

        match (start, end) {
            (Some(start), Some(end)) if start < end => {
                let json_str = output[start + "<verdict>".len()..end].trim();
                debug!(json = json_str, "Found verdict block");
                let verdict: Verdict = serde_json::from_str(json_str)?;
                Ok(Some(verdict))
            }
            (Some(_), Some(_)) => Err(VerdictParseError::InvalidFormat(
                "Malformed verdict block".to_string(),
            )),
            _ => Ok(None),
        }
    }

    fn parse_simple_markers(output: &str) -> Result<Self, VerdictParseError> {
        let upper = output.to_uppercase();

        let accept_markers = ["APPROVED", "[ACCEPT]", "ALL CRITERIA MET", "LGTM"];
        let reject_markers = ["REJECTED", "[REJECT]", "CRITERIA NOT MET", "NEEDS WORK"];

        let has_accept = accept_markers.iter().any(|m| upper.contains(m));
        let has_reject = reject_markers.iter().any(|m| upper.contains(m));

        match (has_accept, has_reject) {
            (true, false) => Ok(Verdict::Accepted {
                summary: "Marked as approved by reviewer".into(),
            }),
            (false, true) => Ok(Verdict::Rejected {
                critique: CritiqueDraft {
                    category: CritiqueCategory::ImplementationDefect,
                    severity: Severity::Major,
                    claim: first_line(output),
                    detail: truncate(output, 500),
                    suggestion: None,
                },
                criterion_id: None,
            }),
            (true, true) => Err(VerdictParseError::AmbiguousVerdict),
            (false, false) => Err(VerdictParseError::NoVerdictFound),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }

    /// Short description for logging
    pub fn short_description(&self) -> String {
        match self {
            Verdict::Accepted { .. } => "ACCEPTED".to_string(),
            Verdict::Rejected { critique, .. } => {
                format!("REJECTED ({}/{})", critique.severity, critique.category)
            }
        }
    }
}

fn first_line(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unspecified finding")
        .to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
