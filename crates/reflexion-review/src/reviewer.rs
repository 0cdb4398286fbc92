use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use reflexion_proxy::{Artifact, CallConfig, ProcessSpawner, ProxyError};

use crate::{ReviewPrompts, Verdict, VerdictParseError};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Reviewer call error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Failed to parse reviewer verdict: {0}")]
    Parse(#[from] VerdictParseError),
}

impl ReviewError {
    /// Transient reviewer failures are retried like any collaborator call;
    /// an unparseable verdict is a content problem, not an outage.
    pub fn retryable(&self) -> bool {
        match self {
            ReviewError::Proxy(e) => e.retryable(),
            ReviewError::Parse(_) => false,
        }
    }
}

impl reflexion_proxy::Retryable for ReviewError {
    fn retryable(&self) -> bool {
        ReviewError::retryable(self)
    }
}

/// A collaborator that judges artifacts against acceptance criteria
#[async_trait]
pub trait ReviewerProxy: Send + Sync {
    /// Human-readable name of the reviewer
    fn name(&self) -> &str;

    /// Evaluate an artifact and return a verdict
    async fn evaluate(
        &self,
        criteria: &[String],
        artifact: &Artifact,
        config: &CallConfig,
    ) -> Result<Verdict, ReviewError>;
}

/// Reviewer backed by an external command. The evaluation prompt goes to
/// stdin; the verdict is parsed from stdout.
pub struct CommandReviewer {
    command: PathBuf,
    args: Vec<String>,
    name: String,
}

impl CommandReviewer {
    pub fn new(command: PathBuf, args: Vec<String>) -> Self {
        let name = command
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.display().to_string());
        Self {
            command,
            args,
            name,
        }
    }
}

#[async_trait]
impl ReviewerProxy for CommandReviewer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        criteria: &[String],
        artifact: &Artifact,
        config: &CallConfig,
    ) -> Result<Verdict, ReviewError> {
        let prompt = ReviewPrompts::build_evaluation_prompt(criteria, artifact);

        debug!(
            reviewer = %self.name,
            prompt_len = prompt.len(),
            criteria = criteria.len(),
            "Running reviewer evaluation"
        );

        let output = ProcessSpawner::spawn(&self.command, &self.args, &prompt, config).await?;

        info!(
            reviewer = %self.name,
            exit_code = output.exit_code,
            duration_secs = output.duration.as_secs_f64(),
            "Reviewer completed"
        );

        if !output.success() {
            return Err(ReviewError::Proxy(ProxyError::Unavailable(format!(
                "{} exited with code {}",
                self.name, output.exit_code
            ))));
        }

        Ok(Verdict::parse(&output.stdout)?)
    }
}
