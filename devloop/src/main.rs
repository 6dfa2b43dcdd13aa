//! `devloop` command-line driver.
//!
//! Runs one engine in the foreground, prints its product log, and answers
//! questions and task-failure prompts from stdin.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use devloop::core::log::{LogEntry, LogLevel};
use devloop::core::types::{FailureResponse, Phase, TaskStatus};
use devloop::engine::{Collaborators, ExecutionEngine, PendingQuestion};
use devloop::events::EngineEvent;
use devloop::exit_codes;
use devloop::io::config::{DEFAULT_CONFIG_FILE, DevloopConfig, load_config, write_config};
use devloop::io::plan_store::{MarkdownPlanParser, load_plan};
use devloop::logging;

#[derive(Parser)]
#[command(
    name = "devloop",
    version,
    about = "Drive a coding agent through interview, plan, implement, review, and test loops"
)]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interview, plan, and implement a feature in the target directory.
    Run {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        feature: String,
        /// Handle task failures with the configured autonomous policy.
        #[arg(long)]
        autonomous: bool,
    },
    /// Continue the plan already present in the target directory.
    Resume {
        #[arg(long)]
        target: PathBuf,
        /// Plan file to load instead of the configured one.
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Parse a plan file and print its tasks.
    Plan { file: PathBuf },
    /// Write a config file with every default spelled out.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            target,
            feature,
            autonomous,
        } => {
            let mut config = load_config(&cli.config)?;
            config.autonomous.enabled |= autonomous;
            let engine = new_engine(config);
            engine.set_target_path(Some(target))?;
            engine.set_feature_description(feature)?;
            let printer = spawn_log_printer(&engine);
            engine.start()?;
            let code = interact(&engine).await;
            printer.abort();
            code
        }
        Command::Resume { target, plan } => {
            let engine = new_engine(load_config(&cli.config)?);
            engine.set_target_path(Some(target))?;
            let count = engine.load_existing_plan(plan)?;
            println!("Loaded plan with {count} tasks");
            let printer = spawn_log_printer(&engine);
            engine.start_with_existing_plan()?;
            let code = interact(&engine).await;
            printer.abort();
            code
        }
        Command::Plan { file } => cmd_plan(&file),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn new_engine(config: DevloopConfig) -> ExecutionEngine {
    let config = Arc::new(config);
    let collaborators = Collaborators::production(&config);
    ExecutionEngine::new(config, collaborators)
}

/// Answer prompts until the run completes, fails, or cannot continue.
async fn interact(engine: &ExecutionEngine) -> Result<i32> {
    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping...");
            stopper.stop();
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match engine.settled().await {
            Phase::Completed => return Ok(exit_codes::OK),
            Phase::Failed => {
                if let Some(entry) = engine.with_context(|ctx| ctx.errors.last().cloned()) {
                    eprintln!("Run failed: {}", entry.message);
                }
                return Ok(exit_codes::FAILED);
            }
            Phase::WaitingForUser => {
                let (question, failure) = engine.with_context(|ctx| {
                    (
                        ctx.pending_question().cloned(),
                        ctx.pending_task_failure.clone(),
                    )
                });
                if let Some(question) = question {
                    print_question(&question);
                    let Some(line) = stdin.next_line().await? else {
                        return Ok(exit_codes::SUSPENDED);
                    };
                    engine.answer_question(resolve_option(&question, line.trim()))?;
                } else if let Some(failure) = failure {
                    println!(
                        "Task {} ({}) failed: {}",
                        failure.task_number, failure.task_title, failure.error
                    );
                    print!("[r]etry, [s]kip, or s[t]op? ");
                    std::io::stdout().flush()?;
                    let Some(line) = stdin.next_line().await? else {
                        return Ok(exit_codes::SUSPENDED);
                    };
                    match parse_failure_response(&line) {
                        Some(response) => engine.handle_task_failure_response(response)?,
                        None => println!("Unrecognized choice {:?}", line.trim()),
                    }
                } else {
                    return Ok(exit_codes::SUSPENDED);
                }
            }
            phase => {
                println!("Run is {phase}");
                return Ok(exit_codes::SUSPENDED);
            }
        }
    }
}

fn spawn_log_printer(engine: &ExecutionEngine) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::LogAppended { entry }) => print_entry(&entry),
                Ok(EngineEvent::PhaseChanged { to, .. }) => println!("==> {to}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => eprintln!("({skipped} log lines dropped)"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_entry(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S");
    match entry.level {
        LogLevel::Agent => println!("{time} {}", entry.message),
        LogLevel::Tool => println!("{time}   > {}", entry.message),
        LogLevel::Info => println!("{time} [info] {}", entry.message),
        LogLevel::Warning => println!("{time} [warn] {}", entry.message),
        LogLevel::Error => eprintln!("{time} [error] {}", entry.message),
    }
}

fn print_question(question: &PendingQuestion) {
    if !question.header.is_empty() {
        println!("[{}]", question.header);
    }
    println!("{}", question.question);
    for (idx, option) in question.options.iter().enumerate() {
        println!("  {}. {option}", idx + 1);
    }
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// A bare number picks the matching option; anything else is a freeform answer.
fn resolve_option(question: &PendingQuestion, input: &str) -> String {
    input
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|idx| question.options.get(idx))
        .cloned()
        .unwrap_or_else(|| input.to_string())
}

fn parse_failure_response(input: &str) -> Option<FailureResponse> {
    match input.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" => Some(FailureResponse::Retry),
        "s" | "skip" => Some(FailureResponse::Skip),
        "t" | "stop" => Some(FailureResponse::Stop),
        _ => None,
    }
}

fn cmd_plan(file: &Path) -> Result<i32> {
    let plan = load_plan(file, &MarkdownPlanParser)?;
    if plan.is_empty() {
        eprintln!("No tasks found in {}", file.display());
        return Ok(exit_codes::FAILED);
    }
    for task in &plan.tasks {
        println!("{} {}", status_mark(task.status), task.label());
        for subtask in &task.subtasks {
            let mark = if subtask.done { "x" } else { " " };
            println!("    [{mark}] {}", subtask.description);
        }
    }
    Ok(exit_codes::OK)
}

fn status_mark(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "[ ]",
        TaskStatus::InProgress => "[>]",
        TaskStatus::Completed => "[x]",
        TaskStatus::Failed => "[!]",
        TaskStatus::Skipped => "[-]",
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &DevloopConfig::default())?;
    println!("Wrote {}", path.display());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parse_run() {
        let cli = Cli::try_parse_from([
            "devloop", "run", "--target", "/tmp/app", "--feature", "Dark mode",
        ])
        .expect("parse");
        match cli.command {
            Command::Run {
                target,
                feature,
                autonomous,
            } => {
                assert_eq!(target, PathBuf::from("/tmp/app"));
                assert_eq!(feature, "Dark mode");
                assert!(!autonomous);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_config_force_with_global_config() {
        let cli = Cli::try_parse_from(["devloop", "init-config", "--force", "--config", "x.toml"])
            .expect("parse");
        assert!(matches!(cli.command, Command::InitConfig { force: true }));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }

    #[test]
    fn numbered_answer_selects_option() {
        let question = PendingQuestion {
            id: Uuid::new_v4(),
            question: "Which database?".into(),
            header: String::new(),
            options: vec!["Postgres".into(), "SQLite".into()],
            multi_select: false,
        };
        assert_eq!(resolve_option(&question, "2"), "SQLite");
        assert_eq!(resolve_option(&question, "9"), "9");
        assert_eq!(resolve_option(&question, "MySQL"), "MySQL");
    }

    #[test]
    fn failure_choices() {
        assert_eq!(parse_failure_response(" R "), Some(FailureResponse::Retry));
        assert_eq!(parse_failure_response("skip"), Some(FailureResponse::Skip));
        assert_eq!(parse_failure_response("t"), Some(FailureResponse::Stop));
        assert_eq!(parse_failure_response("maybe"), None);
    }
}
