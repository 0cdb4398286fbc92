//! Detects the loop going in circles: the reviewer raising the same
//! finding attempt after attempt with the worker unable to move past it.

use reflexion_review::{claim_fingerprint, Critique};

/// Pure check over the recent critique window. No store access; callers
/// hand in the critiques ordered oldest to newest.
#[derive(Debug, Clone, Copy)]
pub struct DeadlockDetector {
    window: usize,
}

impl DeadlockDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }

    /// True when the last `window` critiques are pairwise equivalent:
    /// same category and same normalized-claim fingerprint. Fewer
    /// critiques than the window is never a deadlock.
    pub fn is_deadlocked(&self, critiques: &[Critique]) -> bool {
        if critiques.len() < self.window {
            return false;
        }
        let recent = &critiques[critiques.len() - self.window..];
        let first = &recent[0];
        let first_print = claim_fingerprint(&first.claim);
        recent[1..]
            .iter()
            .all(|c| c.category == first.category && claim_fingerprint(&c.claim) == first_print)
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflexion_review::{CritiqueCategory, Severity};

    fn critique(claim: &str, category: CritiqueCategory) -> Critique {
        Critique {
            id: uuid_like(claim),
            attempt_id: "a".into(),
            category,
            severity: Severity::Major,
            claim: claim.to_string(),
            detail: claim.to_string(),
            suggestion: None,
        }
    }

    fn uuid_like(seed: &str) -> String {
        format!("id-{}", seed.len())
    }

    #[test]
    fn three_equivalent_critiques_deadlock() {
        let detector = DeadlockDetector::new(3);
        let critiques = vec![
            critique("Missing error handling", CritiqueCategory::ImplementationDefect),
            critique("missing   ERROR handling!", CritiqueCategory::ImplementationDefect),
            critique("Missing error handling.", CritiqueCategory::ImplementationDefect),
        ];
        assert!(detector.is_deadlocked(&critiques));
    }

    #[test]
    fn fewer_critiques_than_window_never_deadlock() {
        let detector = DeadlockDetector::new(3);
        let critiques = vec![
            critique("same claim", CritiqueCategory::ImplementationDefect),
            critique("same claim", CritiqueCategory::ImplementationDefect),
        ];
        assert!(!detector.is_deadlocked(&critiques));
    }

    #[test]
    fn differing_category_breaks_the_run() {
        let detector = DeadlockDetector::new(3);
        let critiques = vec![
            critique("same claim", CritiqueCategory::ImplementationDefect),
            critique("same claim", CritiqueCategory::RequirementGap),
            critique("same claim", CritiqueCategory::ImplementationDefect),
        ];
        assert!(!detector.is_deadlocked(&critiques));
    }

    #[test]
    fn only_the_trailing_window_counts() {
        let detector = DeadlockDetector::new(3);
        let critiques = vec![
            critique("old unrelated finding", CritiqueCategory::RequirementGap),
            critique("same claim", CritiqueCategory::ImplementationDefect),
            critique("same claim", CritiqueCategory::ImplementationDefect),
            critique("same claim", CritiqueCategory::ImplementationDefect),
        ];
        assert!(detector.is_deadlocked(&critiques));
    }
}
