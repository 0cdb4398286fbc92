mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use reflexion_core::{
    ConflictManager, ConflictSettings, LoopConfig, ReflexionController, ResponseOutcome,
    TaskOutcome,
};
use reflexion_proxy::{CommandGenerator, CommandWorker};
use reflexion_review::CommandReviewer;
use reflexion_store::{
    Criterion, Database, Evaluator, Party, ResolutionOutcome, Task, TaskStatus,
};
use reflexion_logging::{init_tracing, LogFormat, Logger};

use config::{ProjectConfig, RoleCommand};

#[derive(Parser, Debug)]
#[command(
    name = "reflexion",
    about = "Worker/reviewer convergence loop with challenge-based conflict resolution",
    version,
    author
)]
struct Cli {
    /// Path to the database (default: ~/.local/share/reflexion/reflexion.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormatChoice,

    /// Output results as JSON
    #[arg(long)]
    json_output: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task and print its id
    Create {
        /// What the worker should produce
        description: String,

        /// Acceptance criterion (repeatable); ids are assigned C-1, C-2, ...
        #[arg(long = "criterion", value_name = "TEXT")]
        criteria: Vec<String>,
    },

    /// Drive a task to a terminal outcome
    Run {
        task_id: String,

        /// Working directory for spawned collaborators
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,

        /// Override the configured attempt budget
        #[arg(short = 'n', long)]
        max_attempts: Option<u32>,
    },

    /// Request abandonment; an in-flight run stops at the next boundary
    Abandon { task_id: String },

    /// Record one party's position on an open challenge
    Respond {
        challenge_id: String,

        #[arg(long, value_enum)]
        party: PartyChoice,

        #[arg(long, value_enum)]
        position: PositionChoice,

        #[arg(long)]
        rationale: String,
    },

    /// Dismiss a minor critique with a justification
    Dismiss {
        critique_id: String,

        #[arg(long)]
        justification: String,
    },

    /// Print a task's full audit chain
    Inspect { task_id: String },

    /// List all tasks
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PartyChoice {
    Worker,
    Reviewer,
}

impl From<PartyChoice> for Party {
    fn from(choice: PartyChoice) -> Self {
        match choice {
            PartyChoice::Worker => Party::Worker,
            PartyChoice::Reviewer => Party::Reviewer,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PositionChoice {
    WorkerWasRight,
    ReviewerWasRight,
    BothPartiallyRight,
}

impl From<PositionChoice> for ResolutionOutcome {
    fn from(choice: PositionChoice) -> Self {
        match choice {
            PositionChoice::WorkerWasRight => ResolutionOutcome::WorkerWasRight,
            PositionChoice::ReviewerWasRight => ResolutionOutcome::ReviewerWasRight,
            PositionChoice::BothPartiallyRight => ResolutionOutcome::BothPartiallyRight,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: LogFormat = cli.log_format.into();
    init_tracing("warn", log_format);

    let db = Arc::new(match cli.db {
        Some(ref path) => Database::open_at(path)?,
        None => Database::open()?,
    });

    match cli.command {
        Command::Create {
            description,
            criteria,
        } => {
            let criteria = criteria
                .into_iter()
                .enumerate()
                .map(|(i, text)| Criterion {
                    id: format!("C-{}", i + 1),
                    text,
                })
                .collect();
            let task = Task::new(description, criteria);
            db.tasks().create(&task)?;
            if cli.json_output {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                println!("{}", task.id);
            }
            Ok(())
        }

        Command::Run {
            ref task_id,
            ref working_dir,
            max_attempts,
        } => {
            let working_dir = working_dir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().expect("no current directory"));
            let project = ProjectConfig::load(&working_dir)?.unwrap_or_default();

            let mut loop_config = project.loop_config.clone();
            if let Some(n) = max_attempts {
                loop_config.max_attempts = n;
            }

            let worker_cmd = project
                .worker
                .as_ref()
                .context("reflexion.toml must configure a [worker] command")?;
            let reviewer_cmd = project
                .reviewer
                .as_ref()
                .context("reflexion.toml must configure a [reviewer] command")?;

            let outcome = run(
                Arc::clone(&db),
                task_id,
                &working_dir,
                loop_config,
                worker_cmd,
                reviewer_cmd,
                project.generator.as_ref(),
                log_format,
            )
            .await?;

            if cli.json_output {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            std::process::exit(outcome.exit_code());
        }

        Command::Abandon { ref task_id } => {
            db.tasks().request_abandon(task_id)?;
            eprintln!(
                "Abandon requested for {}; an in-flight run stops at the next boundary",
                task_id
            );
            Ok(())
        }

        Command::Respond {
            ref challenge_id,
            party,
            position,
            ref rationale,
        } => {
            let conflicts = conflict_manager(&db, &LoopConfig::default());
            let outcome =
                conflicts.respond(challenge_id, party.into(), position.into(), rationale)?;
            match outcome {
                ResponseOutcome::Resolved(resolution) if cli.json_output => {
                    println!("{}", serde_json::to_string_pretty(&resolution)?)
                }
                ResponseOutcome::Resolved(resolution) => println!(
                    "Challenge settled: {} (via {})",
                    resolution.outcome, resolution.resolved_by
                ),
                ResponseOutcome::Escalated => {
                    println!("Parties disagree and precedent is inconclusive; escalated for a human")
                }
                ResponseOutcome::AwaitingCounterparty => {
                    println!("Position recorded; awaiting the other party")
                }
            }
            Ok(())
        }

        Command::Dismiss {
            ref critique_id,
            ref justification,
        } => {
            let critique = db
                .attempts()
                .critique(critique_id)?
                .with_context(|| format!("No critique {}", critique_id))?;
            let attempt = db
                .attempts()
                .get(&critique.attempt_id)?
                .with_context(|| format!("No attempt {}", critique.attempt_id))?;
            let conflicts = conflict_manager(&db, &LoopConfig::default());
            let resolution = conflicts.dismiss_minor(&attempt.task_id, &critique, justification)?;
            println!("Dismissed: {}", resolution.rationale);
            Ok(())
        }

        Command::Inspect { ref task_id } => {
            let chain = db.chain(task_id)?;
            if cli.json_output {
                println!("{}", serde_json::to_string_pretty(&chain)?);
            } else {
                println!("{}", chain.summary());
            }
            Ok(())
        }

        Command::List => {
            let tasks = db.tasks().list()?;
            if cli.json_output {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                for task in tasks {
                    let status = match task.status {
                        TaskStatus::Converged => task.status.to_string().green().to_string(),
                        TaskStatus::Escalated => task.status.to_string().red().to_string(),
                        _ => task.status.to_string(),
                    };
                    println!("{}  {:10}  {}", task.id, status, task.description);
                }
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    db: Arc<Database>,
    task_id: &str,
    working_dir: &std::path::Path,
    loop_config: LoopConfig,
    worker_cmd: &RoleCommand,
    reviewer_cmd: &RoleCommand,
    generator_cmd: Option<&RoleCommand>,
    log_format: LogFormat,
) -> Result<TaskOutcome> {
    let worker = Arc::new(CommandWorker::new(
        worker_cmd.command.clone(),
        worker_cmd.args.clone(),
    ));
    let reviewer = Arc::new(CommandReviewer::new(
        reviewer_cmd.command.clone(),
        reviewer_cmd.args.clone(),
    ));

    let call_config = reflexion_proxy::CallConfig::new(working_dir.to_path_buf())
        .with_timeout(loop_config.call_timeout);

    let mut controller = ReflexionController::new(db.clone(), worker, reviewer, loop_config)
        .with_call_config(call_config)
        .with_logger(Arc::new(Logger::new(log_format)));
    if let Some(cmd) = generator_cmd {
        controller = controller
            .with_generator(Arc::new(CommandGenerator::new(cmd.command.clone(), cmd.args.clone())));
    }

    // Ctrl+C requests abandonment; the loop honors it at the next boundary
    let ctrlc_db = Arc::clone(&db);
    let ctrlc_task = task_id.to_string();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received; stopping at the next attempt boundary...");
        if let Err(e) = ctrlc_db.tasks().request_abandon(&ctrlc_task) {
            eprintln!("Failed to record abandon request: {}", e);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(controller.run_task(task_id).await?)
}

fn conflict_manager(db: &Arc<Database>, config: &LoopConfig) -> ConflictManager {
    let evaluator = Arc::new(Evaluator::new(Arc::clone(db), config.pattern_half_life));
    ConflictManager::new(
        Arc::clone(db),
        evaluator,
        ConflictSettings {
            response_window: config.response_window,
            min_pattern_support: config.min_pattern_support,
            consistency_threshold: config.consistency_threshold,
        },
    )
}

fn print_outcome(outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Converged {
            attempts, summary, ..
        } => {
            eprintln!();
            eprintln!("{}", "=== CONVERGED ===".green().bold());
            eprintln!("Attempts: {}", attempts);
            eprintln!("Summary: {}", summary);
        }
        TaskOutcome::Escalated {
            attempts,
            reason,
            chain,
        } => {
            eprintln!();
            eprintln!("{}", "=== ESCALATED ===".red().bold());
            eprintln!("Reason: {}", reason);
            eprintln!("Attempts: {}", attempts);
            eprintln!("{}", chain.summary());
        }
        TaskOutcome::Abandoned { attempts, .. } => {
            eprintln!();
            eprintln!("{}", "=== ABANDONED ===".yellow().bold());
            eprintln!("Attempts: {}", attempts);
        }
    }
}
