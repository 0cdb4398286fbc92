mod claim;
mod critique;
mod prompts;
mod reviewer;
mod verdict;

pub use claim::{claim_fingerprint, normalize_claim};
pub use critique::{Critique, CritiqueCategory, CritiqueDraft, Severity};
pub use prompts::ReviewPrompts;
pub use reviewer::{CommandReviewer, ReviewError, ReviewerProxy};
pub use verdict::{Verdict, VerdictParseError};
