use serde::{Deserialize, Serialize};

/// Severity of a critique finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Major => write!(f, "major"),
            Severity::Minor => write!(f, "minor"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "major" => Ok(Severity::Major),
            "minor" => Ok(Severity::Minor),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// What kind of problem the reviewer is pointing at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueCategory {
    /// The artifact misses a stated requirement
    RequirementGap,
    /// The artifact attempts the requirement but gets it wrong
    ImplementationDefect,
    /// The reviewer suspects the instructions themselves are ambiguous
    AmbiguitySuspected,
    /// Cosmetic concerns only
    StyleOnly,
}

impl std::fmt::Display for CritiqueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CritiqueCategory::RequirementGap => write!(f, "requirement_gap"),
            CritiqueCategory::ImplementationDefect => write!(f, "implementation_defect"),
            CritiqueCategory::AmbiguitySuspected => write!(f, "ambiguity_suspected"),
            CritiqueCategory::StyleOnly => write!(f, "style_only"),
        }
    }
}

impl std::str::FromStr for CritiqueCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirement_gap" => Ok(CritiqueCategory::RequirementGap),
            "implementation_defect" => Ok(CritiqueCategory::ImplementationDefect),
            "ambiguity_suspected" => Ok(CritiqueCategory::AmbiguitySuspected),
            "style_only" => Ok(CritiqueCategory::StyleOnly),
            _ => Err(format!("Unknown critique category: {}", s)),
        }
    }
}

/// A critique as produced by the reviewer, before it is attached to an
/// attempt. The reviewer does not know attempt ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueDraft {
    pub category: CritiqueCategory,
    pub severity: Severity,
    /// One-line statement of the finding, used for deadlock and pattern
    /// comparison
    pub claim: String,
    /// Full explanation
    pub detail: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Structured feedback attached to a rejected attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    pub attempt_id: String,
    pub category: CritiqueCategory,
    pub severity: Severity,
    pub claim: String,
    pub detail: String,
    pub suggestion: Option<String>,
}

impl Critique {
    /// Attach a draft to a concrete attempt
    pub fn from_draft(draft: CritiqueDraft, attempt_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            category: draft.category,
            severity: draft.severity,
            claim: draft.claim,
            detail: draft.detail,
            suggestion: draft.suggestion,
        }
    }

    /// A minor style nit never blocks convergence on its own
    pub fn blocks_convergence(&self) -> bool {
        !(self.category == CritiqueCategory::StyleOnly && self.severity == Severity::Minor)
    }

    /// Render the critique as feedback text for the next attempt
    pub fn as_feedback(&self) -> String {
        let mut text = format!("[{}/{}] {}\n{}", self.severity, self.category, self.claim, self.detail);
        if let Some(ref suggestion) = self.suggestion {
            text.push_str("\nSuggestion: ");
            text.push_str(suggestion);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn critique(category: CritiqueCategory, severity: Severity) -> Critique {
        Critique {
            id: "c-1".into(),
            attempt_id: "a-1".into(),
            category,
            severity,
            claim: "naming is inconsistent".into(),
            detail: "helpers use both snake and camel case".into(),
            suggestion: None,
        }
    }

    #[test]
    fn minor_style_nit_does_not_block() {
        let c = critique(CritiqueCategory::StyleOnly, Severity::Minor);
        assert!(!c.blocks_convergence());
    }

    #[test]
    fn major_defect_blocks() {
        let c = critique(CritiqueCategory::ImplementationDefect, Severity::Major);
        assert!(c.blocks_convergence());
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in [
            CritiqueCategory::RequirementGap,
            CritiqueCategory::ImplementationDefect,
            CritiqueCategory::AmbiguitySuspected,
            CritiqueCategory::StyleOnly,
        ] {
            let parsed: CritiqueCategory = category.to_string().parse().unwrap();
            assert_eq!(parsed, category);
        }
    }
}
