mod config;
mod conflict;
mod controller;
mod deadlock;
mod error;
mod improver;
mod outcome;

pub use config::LoopConfig;
pub use conflict::{ConflictError, ConflictManager, ConflictSettings, ResponseOutcome};
pub use controller::{EscalationHook, ReflexionController};
pub use deadlock::DeadlockDetector;
pub use error::LoopError;
pub use improver::{Improver, RevisedInstructions};
pub use outcome::{EscalationReason, TaskOutcome};
