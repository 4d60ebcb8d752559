mod stream;

use anyhow::{Context, Result, bail};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::warn;

use dataloop::core::config::{DEFAULT_CONFIG_FILE, EngineConfig};
use dataloop::core::store::{RunStore, SqliteRunStore};
use dataloop::core::terminal::{self, GuideSection, print_error};
use dataloop::core::workflow::{ProgressEvent, ProgressSink, RunReport, RunStatus, Runner};
use dataloop::logging;

use stream::AnswerPrinter;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Questions")
        .command("ask <question>", "Answer a question against the configured backends")
        .command("resume [<run-id>]", "Resume one run, or every run whose owner went quiet")
        .command("show <run-id>", "Print a stored run")
        .print();

    GuideSection::new("Options")
        .command("--config, -c <path>", "Config file (default: ./dataloop.toml)")
        .command("--session, -s <id>", "Session the question belongs to")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("dataloop").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Ask { question: String, session: String },
    Resume { run_id: Option<String> },
    Show { run_id: String },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub command: Command,
    pub config: PathBuf,
}

/// Flags may appear anywhere after the command; everything else is
/// positional. Positionals of `ask` are joined into the question.
pub(crate) fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut config = PathBuf::from(DEFAULT_CONFIG_FILE);
    let mut session: Option<String> = None;
    let mut positional = Vec::new();
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    bail!("--config needs a path");
                }
            }
            "--session" | "-s" => {
                if i + 1 < args.len() {
                    session = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    bail!("--session needs an id");
                }
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    let command = match cmd {
        "ask" => {
            let question = positional.join(" ");
            if question.trim().is_empty() {
                bail!("ask needs a question");
            }
            Command::Ask {
                question,
                session: session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            }
        }
        "resume" => Command::Resume {
            run_id: positional.into_iter().next(),
        },
        "show" => match positional.into_iter().next() {
            Some(run_id) => Command::Show { run_id },
            None => bail!("show needs a run id"),
        },
        "help" | "--help" | "-h" => Command::Help,
        other => bail!("unknown command '{}'", other),
    };
    Ok(CliArgs { command, config })
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let parsed = match parse_args(&args) {
        Ok(p) => p,
        Err(e) => {
            print_error(&e.to_string());
            print_help();
            return Ok(());
        }
    };
    if parsed.command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = EngineConfig::load(&parsed.config).await?;
    logging::init(config.log_level(), config.log_file.as_deref())?;

    match parsed.command {
        Command::Ask { question, session } => ask(&config, &session, &question).await,
        Command::Resume { run_id } => resume(&config, run_id).await,
        Command::Show { run_id } => show(&config, &run_id).await,
        Command::Help => Ok(()),
    }
}

async fn start_runner(config: &EngineConfig) -> Result<Arc<Runner>> {
    let runner = Arc::new(Runner::from_config(config).await?);
    let on_signal = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            terminal::print_warn("Cancelling...");
            on_signal.shutdown();
        }
    });
    Ok(runner)
}

async fn ask(config: &EngineConfig, session: &str, question: &str) -> Result<()> {
    let runner = start_runner(config).await?;
    let (progress, rx) = ProgressSink::channel();
    let printer = tokio::spawn(render_progress(rx));
    let result = runner
        .run_with_progress(session, question, Vec::new(), progress)
        .await;
    finish_rendering(printer).await;
    let report = result?;
    print_footer(&report);
    Ok(())
}

async fn resume(config: &EngineConfig, run_id: Option<String>) -> Result<()> {
    let runner = start_runner(config).await?;
    match run_id {
        Some(run_id) => {
            let (progress, rx) = ProgressSink::channel();
            let printer = tokio::spawn(render_progress(rx));
            let result = runner.resume(&run_id, progress).await;
            finish_rendering(printer).await;
            print_footer(&result?);
        }
        None => {
            let reports = runner.resume_stale().await?;
            if reports.is_empty() {
                terminal::print_info("No abandoned runs to resume.");
            }
            for report in reports {
                terminal::print_status(&report.run_id, report.status.as_str());
            }
        }
    }
    Ok(())
}

async fn show(config: &EngineConfig, run_id: &str) -> Result<()> {
    let store = SqliteRunStore::open(config.database_path()).await?;
    let run = store
        .load_run(run_id)
        .await?
        .with_context(|| format!("run {} not found", run_id))?;

    let mut summary = GuideSection::new(&format!("Run {}", run.id))
        .status("Session", &run.session_id)
        .status("Question", &run.question)
        .status("Status", run.status.as_str())
        .status("Iterations", &run.iteration.to_string())
        .status("Claimed by", run.claimed_by.as_deref().unwrap_or("-"))
        .status("LLM calls", &run.metrics.llm_calls.to_string());
    if run.truncated {
        summary = summary.status("Truncated", "yes");
    }
    if let Some(error) = &run.error {
        summary = summary.status("Error", error);
    }
    summary.print();

    if !run.executed_queries.is_empty() {
        let mut queries = GuideSection::new("Queries");
        for q in &run.executed_queries {
            let outcome = match &q.result.error {
                Some(e) => format!("{}", style(e).red()),
                None => format!("{} rows, {} ms", q.result.row_count, q.duration_ms),
            };
            queries = queries.text(&format!("{} ({})", q.question, outcome));
        }
        queries.print();
    }
    if let Some(answer) = &run.answer {
        println!("\n{}", answer);
    }
    Ok(())
}

async fn render_progress(mut rx: UnboundedReceiver<ProgressEvent>) {
    let mut printer = AnswerPrinter::default();
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::RunStarted { run_id, iteration } if iteration > 0 => {
                terminal::print_info(&format!("Resuming {} at step {}", run_id, iteration));
            }
            ProgressEvent::RunStarted { .. } => {}
            ProgressEvent::TextDelta { text } => printer.push(&text),
            ProgressEvent::TextReset => {
                printer.break_segment();
                terminal::print_warn("Model call interrupted; retrying.");
            }
            ProgressEvent::Thinking { .. } => {}
            ProgressEvent::ToolCall { name, .. } => {
                printer.break_segment();
                terminal::print_tool_call(&name);
            }
            ProgressEvent::ToolResult { .. } | ProgressEvent::Checkpointed { .. } => {}
            ProgressEvent::QueryExecuted { query } => {
                terminal::print_query(&query.question, query.result.is_error());
            }
            ProgressEvent::Completed { report } => {
                if report.truncated || !printer.streamed_segment() {
                    printer.break_segment();
                    println!("{}", report.user_message());
                } else {
                    printer.finish();
                }
                for follow_up in &report.follow_ups {
                    println!("  {} {}", style("→").cyan(), style(follow_up).dim());
                }
            }
            ProgressEvent::Failed { message } => print_error(&message),
            ProgressEvent::Cancelled => terminal::print_warn("Run cancelled."),
        }
    }
}

async fn finish_rendering(printer: JoinHandle<()>) {
    if let Err(e) = printer.await {
        warn!("Progress renderer stopped abnormally: {}", e);
    }
}

fn print_footer(report: &RunReport) {
    if report.status == RunStatus::Completed && report.truncated {
        terminal::print_warn("Step limit reached; the answer above may be incomplete.");
    }
    eprintln!(
        "{}",
        style(format!(
            "run {} · {} queries · {} LLM calls · {} input / {} output tokens",
            report.run_id,
            report.executed_queries,
            report.metrics.llm_calls,
            report.metrics.usage.input_tokens,
            report.metrics.usage.output_tokens
        ))
        .dim()
    );
}
