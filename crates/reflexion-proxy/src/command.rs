use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::{
    Artifact, CallConfig, InstructionGenerator, ProcessSpawner, ProxyError, TaskContext,
    WorkerProxy,
};

/// Worker backed by an external command.
///
/// The instructions are written to the command's stdin together with the
/// task description and acceptance criteria; stdout becomes the artifact.
pub struct CommandWorker {
    command: PathBuf,
    args: Vec<String>,
    name: String,
}

impl CommandWorker {
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

    fn build_payload(instructions: &str, context: &TaskContext) -> String {
        let mut payload = String::new();
        payload.push_str("# Task\n");
        payload.push_str(&context.description);
        payload.push_str("\n\n# Acceptance criteria\n");
        for criterion in &context.acceptance_criteria {
            payload.push_str("- ");
            payload.push_str(criterion);
            payload.push('\n');
        }
        payload.push_str("\n# Instructions\n");
        payload.push_str(instructions);
        payload.push('\n');
        payload
    }
}

#[async_trait]
impl WorkerProxy for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        instructions: &str,
        context: &TaskContext,
        config: &CallConfig,
    ) -> Result<Artifact, ProxyError> {
        let payload = Self::build_payload(instructions, context);
        let output = ProcessSpawner::spawn(&self.command, &self.args, &payload, config).await?;

        if !output.success() {
            return Err(ProxyError::Unavailable(format!(
                "{} exited with code {}: {}",
                self.name,
                output.exit_code,
                truncate(&output.stderr, 300)
            )));
        }

        debug!(
            worker = %self.name,
            task_id = %context.task_id,
            lines = output.stdout.lines().count(),
            "Worker produced artifact"
        );

        let mut metadata = HashMap::new();
        metadata.insert("worker".to_string(), self.name.clone());
        metadata.insert("exit_code".to_string(), output.exit_code.to_string());
        Ok(Artifact::new(output.stdout, metadata, output.duration))
    }
}

/// Instruction generator backed by an external command.
///
/// Receives the bounded revision prompt on stdin and must print the revised
/// instructions on stdout.
pub struct CommandGenerator {
    command: PathBuf,
    args: Vec<String>,
    name: String,
}

impl CommandGenerator {
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
impl InstructionGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        base_instructions: &str,
        critique: &str,
        pattern_notes: &[String],
        config: &CallConfig,
    ) -> Result<String, ProxyError> {
        let mut prompt = String::new();
        prompt.push_str("# Current instructions\n");
        prompt.push_str(base_instructions);
        prompt.push_str("\n\n# Latest critique\n");
        prompt.push_str(critique);
        if !pattern_notes.is_empty() {
            prompt.push_str("\n\n# Recurring issues to pre-empt\n");
            for note in pattern_notes {
                prompt.push_str("- ");
                prompt.push_str(note);
                prompt.push('\n');
            }
        }
        prompt.push_str("\nRewrite the instructions to address the critique. Print only the revised instructions.\n");

        let output = ProcessSpawner::spawn(&self.command, &self.args, &prompt, config).await?;

        if !output.success() || output.stdout.trim().is_empty() {
            return Err(ProxyError::CallFailed(format!(
                "{} produced no revision (exit {})",
                self.name, output.exit_code
            )));
        }

        Ok(output.stdout)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
