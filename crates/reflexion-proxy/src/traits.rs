use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::Artifact;

/// Errors that can occur at the collaborator boundary
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to spawn collaborator process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Collaborator call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Collaborator not found at path: {0}")]
    NotFound(String),

    #[error("Collaborator configuration error: {0}")]
    ConfigError(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator call failed: {0}")]
    CallFailed(String),
}

impl ProxyError {
    /// Whether the call may succeed if repeated.
    ///
    /// Timeouts, spawn failures and unavailability are transient; a missing
    /// binary or a bad configuration will fail the same way every time.
    pub fn retryable(&self) -> bool {
        match self {
            ProxyError::SpawnFailed(_) | ProxyError::Timeout(_) | ProxyError::Unavailable(_) => {
                true
            }
            ProxyError::NotFound(_) | ProxyError::ConfigError(_) | ProxyError::CallFailed(_) => {
                false
            }
        }
    }
}

/// Configuration for a single collaborator call
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Working directory for the collaborator
    pub working_dir: PathBuf,
    /// Optional timeout (None = no limit)
    pub timeout: Option<std::time::Duration>,
    /// Additional environment variables
    pub env_vars: HashMap<String, String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
            env_vars: HashMap::new(),
        }
    }
}

impl CallConfig {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: String, value: String) -> Self {
        self.env_vars.insert(key, value);
        self
    }
}

/// Task information handed to the worker alongside the instructions
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
}

/// A collaborator that produces an artifact from instructions
#[async_trait]
pub trait WorkerProxy: Send + Sync {
    /// Human-readable name of the worker (e.g. the command it wraps)
    fn name(&self) -> &str;

    /// Execute the instructions and return the produced artifact
    async fn execute(
        &self,
        instructions: &str,
        context: &TaskContext,
        config: &CallConfig,
    ) -> Result<Artifact, ProxyError>;
}

/// A collaborator that rewrites instructions from critique and mined patterns
#[async_trait]
pub trait InstructionGenerator: Send + Sync {
    /// Name of the generator
    fn name(&self) -> &str;

    /// Produce revised instructions. The prompt is already bounded by the
    /// caller; implementations must not accumulate history of their own.
    async fn generate(
        &self,
        base_instructions: &str,
        critique: &str,
        pattern_notes: &[String],
        config: &CallConfig,
    ) -> Result<String, ProxyError>;
}
