use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Structured log events for the review loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    TaskStarted {
        task_id: String,
        description: String,
        max_attempts: u32,
    },
    TaskResumed {
        task_id: String,
        prior_attempts: usize,
    },
    AttemptStarted {
        task_id: String,
        sequence: u32,
        instructions_preview: String,
    },
    WorkerCompleted {
        sequence: u32,
        artifact_lines: usize,
        duration_secs: f64,
    },
    ReviewerCompleted {
        sequence: u32,
        verdict: String,
    },
    VerdictRecorded {
        sequence: u32,
        verdict: String,
    },
    RetryScheduled {
        call: String,
        attempt: u32,
        delay_ms: u64,
    },
    ChallengeOpened {
        challenge_id: String,
        claim: String,
    },
    ChallengeResponded {
        challenge_id: String,
        party: String,
    },
    ChallengeResolved {
        challenge_id: String,
        outcome: String,
        resolved_by: String,
    },
    ChallengeEscalated {
        challenge_id: String,
        reason: String,
    },
    DeadlockDetected {
        task_id: String,
        window: usize,
    },
    InstructionsRevised {
        sequence: u32,
        generator: String,
        fallback: bool,
    },
    DuplicateRecordIgnored {
        attempt_id: String,
        kind: String,
    },
    TaskConverged {
        task_id: String,
        attempts: u32,
        summary: String,
        duration_secs: f64,
    },
    TaskEscalated {
        task_id: String,
        reason: String,
        attempts: u32,
    },
    TaskAbandoned {
        task_id: String,
        attempts: u32,
    },
}

impl LogEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logger for loop events - handles both console output and file logging
pub struct Logger {
    format: LogFormat,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            file_writer: None,
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, event: &LogEvent) {
        // File sink is always JSON lines
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let json = event.with_timestamp();
                let _ = writeln!(file, "{}", json);
            }
        }

        match self.format {
            LogFormat::Json => self.log_json(event),
            LogFormat::Pretty => self.log_pretty(event),
            LogFormat::Compact => self.log_compact(event),
        }
    }

    fn log_json(&self, event: &LogEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        match event {
            LogEvent::TaskStarted {
                task_id,
                description,
                max_attempts,
            } => {
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{} {} {}",
                    "reflexion".bold().bright_white(),
                    "task".dimmed(),
                    task_id.bright_blue()
                );
                let _ = writeln!(
                    stderr,
                    "  {} {}",
                    "goal:".dimmed(),
                    Self::truncate(description, 80)
                );
                let _ = writeln!(stderr, "  {} {}", "budget:".dimmed(), max_attempts);
            }
            LogEvent::TaskResumed {
                task_id,
                prior_attempts,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} resuming {} with {} prior attempt(s)",
                    "↻".bright_yellow(),
                    task_id.bright_blue(),
                    prior_attempts
                );
            }
            LogEvent::AttemptStarted { sequence, .. } => {
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{}",
                    format!("── attempt {} ──", sequence).bright_blue().bold()
                );
            }
            LogEvent::WorkerCompleted {
                artifact_lines,
                duration_secs,
                ..
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} worker produced {} line(s) ({:.1}s)",
                    "▶".bright_cyan(),
                    artifact_lines,
                    duration_secs
                );
            }
            LogEvent::ReviewerCompleted { verdict, .. } => {
                let colored_verdict = if verdict.starts_with("ACCEPTED") {
                    verdict.bright_green()
                } else {
                    verdict.bright_yellow()
                };
                let _ = writeln!(stderr, "  {} reviewer: {}", "◆".bright_magenta(), colored_verdict);
            }
            LogEvent::VerdictRecorded { .. } => {}
            LogEvent::RetryScheduled {
                call,
                attempt,
                delay_ms,
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} {} retry {} in {}ms",
                    "…".dimmed(),
                    call,
                    attempt,
                    delay_ms
                );
            }
            LogEvent::ChallengeOpened { challenge_id, claim } => {
                let _ = writeln!(
                    stderr,
                    "  {} challenge {} opened: {}",
                    "⚑".bright_yellow(),
                    challenge_id,
                    Self::truncate(claim, 70)
                );
            }
            LogEvent::ChallengeResponded {
                challenge_id,
                party,
            } => {
                let _ = writeln!(stderr, "    {} responded on {}", party, challenge_id);
            }
            LogEvent::ChallengeResolved {
                challenge_id,
                outcome,
                resolved_by,
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} challenge {} resolved: {} (via {})",
                    "✓".bright_green(),
                    challenge_id,
                    outcome,
                    resolved_by
                );
            }
            LogEvent::ChallengeEscalated {
                challenge_id,
                reason,
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} challenge {} escalated: {}",
                    "✗".bright_red(),
                    challenge_id,
                    reason
                );
            }
            LogEvent::DeadlockDetected { window, .. } => {
                let _ = writeln!(
                    stderr,
                    "  {} deadlock: same critique {} attempts in a row",
                    "✗".bright_red(),
                    window
                );
            }
            LogEvent::InstructionsRevised {
                generator,
                fallback,
                ..
            } => {
                let note = if *fallback {
                    " (templated fallback)"
                } else {
                    ""
                };
                let _ = writeln!(
                    stderr,
                    "  {} instructions revised by {}{}",
                    "✎".bright_cyan(),
                    generator,
                    note
                );
            }
            LogEvent::DuplicateRecordIgnored { attempt_id, kind } => {
                let _ = writeln!(
                    stderr,
                    "  {} duplicate {} record for {} ignored",
                    "…".dimmed(),
                    kind,
                    attempt_id
                );
            }
            LogEvent::TaskConverged {
                attempts,
                summary,
                duration_secs,
                ..
            } => {
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{} converged after {} attempt(s) in {:.1}s",
                    "✓".bright_green().bold(),
                    attempts,
                    duration_secs
                );
                let _ = writeln!(stderr, "  {}", Self::truncate(summary, 100).dimmed());
            }
            LogEvent::TaskEscalated {
                task_id,
                reason,
                attempts,
            } => {
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{} {} escalated after {} attempt(s): {}",
                    "✗".bright_red().bold(),
                    task_id.bright_blue(),
                    attempts,
                    reason.bright_red()
                );
            }
            LogEvent::TaskAbandoned { task_id, attempts } => {
                let _ = writeln!(
                    stderr,
                    "{} {} abandoned after {} attempt(s)",
                    "⊘".bright_yellow(),
                    task_id.bright_blue(),
                    attempts
                );
            }
        }
    }

    fn log_compact(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        let line = match event {
            LogEvent::TaskStarted { task_id, .. } => format!("start {}", task_id),
            LogEvent::TaskResumed { task_id, .. } => format!("resume {}", task_id),
            LogEvent::AttemptStarted { sequence, .. } => format!("attempt {}", sequence),
            LogEvent::WorkerCompleted { sequence, .. } => format!("worker done {}", sequence),
            LogEvent::ReviewerCompleted { sequence, verdict } => {
                format!("review {} {}", sequence, verdict)
            }
            LogEvent::VerdictRecorded { sequence, verdict } => {
                format!("verdict {} {}", sequence, verdict)
            }
            LogEvent::RetryScheduled { call, attempt, .. } => {
                format!("retry {} #{}", call, attempt)
            }
            LogEvent::ChallengeOpened { challenge_id, .. } => {
                format!("challenge {} open", challenge_id)
            }
            LogEvent::ChallengeResponded { challenge_id, party } => {
                format!("challenge {} response {}", challenge_id, party)
            }
            LogEvent::ChallengeResolved {
                challenge_id,
                outcome,
                ..
            } => format!("challenge {} {}", challenge_id, outcome),
            LogEvent::ChallengeEscalated { challenge_id, .. } => {
                format!("challenge {} escalated", challenge_id)
            }
            LogEvent::DeadlockDetected { task_id, .. } => format!("deadlock {}", task_id),
            LogEvent::InstructionsRevised { sequence, .. } => format!("revise {}", sequence),
            LogEvent::DuplicateRecordIgnored { attempt_id, .. } => {
                format!("dup-record {}", attempt_id)
            }
            LogEvent::TaskConverged {
                task_id, attempts, ..
            } => format!("converged {} ({})", task_id, attempts),
            LogEvent::TaskEscalated {
                task_id, reason, ..
            } => format!("escalated {} {}", task_id, reason),
            LogEvent::TaskAbandoned { task_id, .. } => format!("abandoned {}", task_id),
        };
        let _ = writeln!(stderr, "{}", line);
    }

    fn truncate(s: &str, max: usize) -> String {
        if s.chars().count() > max {
            let cut: String = s.chars().take(max).collect();
            format!("{}...", cut)
        } else {
            s.to_string()
        }
    }
}
