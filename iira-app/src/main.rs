//! IIRA main binary: incident resolution service and operator CLI.

mod app;
mod config;
mod embedding;
mod error;
mod feedback;
mod index;
mod init;
mod model;
mod monitor;
mod planner;
mod procedures;
mod resolver;
mod retrieval;
mod runner;
mod script_index;
mod script_resolver;
mod store;
mod thresholds;

use crate::app::App;
use crate::config::IiraConfig;
use crate::feedback::FeedbackSubmission;
use crate::model::{Incident, IncidentStatus};
use crate::retrieval::SearchQuery;
use crate::store::NewScript;
use crate::thresholds::parse_threshold_setting;
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "iira", version, about = "Intelligent incident resolution assistant")]
struct Cli {
    /// Config file (default: ~/.iira/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll for new incidents and resolve them until Ctrl-C (default).
    Serve,
    /// Initialize ~/.iira with a config template (idempotent).
    Init,
    /// Resolve one stored incident now.
    Resolve { number: String },
    /// Search procedures for an incident text.
    Search {
        query: String,
        /// Long description, searched together with the query.
        #[arg(long)]
        aux: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Return ranked candidates regardless of score.
        #[arg(long)]
        no_threshold: bool,
    },
    /// Show the plan and script bindings for an incident text without running anything.
    Plan {
        query: String,
        #[arg(long)]
        aux: Option<String>,
    },
    /// Ingest a plain-text SOP file, or every .txt file in a directory.
    Ingest { path: PathBuf },
    #[command(subcommand)]
    Procedures(ProceduresCommand),
    #[command(subcommand)]
    Scripts(ScriptsCommand),
    #[command(subcommand)]
    Incidents(IncidentsCommand),
    #[command(subcommand)]
    Feedback(FeedbackCommand),
    /// Resolution history, newest first.
    History {
        /// Show only the latest trace for this incident.
        #[arg(long)]
        incident: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
    #[command(subcommand)]
    Thresholds(ThresholdsCommand),
    /// Script and SOP catalogue changes, newest first.
    Activity {
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
}

#[derive(Debug, Subcommand)]
enum ProceduresCommand {
    List,
    Delete { id: String },
    /// Structure a free-form SOP document with the model and bind its steps to scripts.
    Draft {
        file: PathBuf,
        /// Store the draft after binding.
        #[arg(long)]
        ingest: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ScriptsCommand {
    List,
    /// Register a script described by a TOML file.
    Add { file: PathBuf },
    /// Replace a script with the definition in a TOML file.
    Update { id: i64, file: PathBuf },
    Delete { id: i64 },
    /// Best script for a step description.
    Match { description: String },
    /// Rebuild the script search index from the registry.
    Sync,
    /// Run a registered script directly.
    Run {
        name: String,
        /// KEY=VALUE, repeatable. Values that parse as JSON are passed as JSON.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum IncidentsCommand {
    /// Import incidents from a JSON file (one object or an array).
    Add { file: PathBuf },
    List {
        #[arg(long, default_value = "New")]
        status: String,
    },
}

#[derive(Debug, Subcommand)]
enum FeedbackCommand {
    /// Record a vote from a JSON file.
    Submit { file: PathBuf },
    Stats,
    /// Seed feedback counters from well-confirmed history.
    Warm,
}

#[derive(Debug, Subcommand)]
enum ThresholdsCommand {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    if let Command::Init = command {
        let report = init::initialize_default().await?;
        if report.created.is_empty() {
            println!("iira init: already initialized at {}", report.root.display());
        } else {
            println!("iira init: initialized {}", report.root.display());
            for path in &report.created {
                println!("created {}", path.display());
            }
        }
        println!("next: edit {}", report.root.join("config.toml").display());
        return Ok(());
    }

    let config = IiraConfig::load(cli.config).await?;
    let app = App::build(config).await?;
    run(app, command).await
}

async fn run(app: App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => app.serve().await,
        Command::Init => Ok(()),
        Command::Resolve { number } => print_json(&app.resolve_number(&number).await?),
        Command::Search {
            query,
            aux,
            top_k,
            no_threshold,
        } => {
            let outcome = app
                .retrieval
                .search(&SearchQuery {
                    text: &query,
                    aux: aux.as_deref(),
                    top_k: top_k.unwrap_or(app.config.retrieval.top_k),
                    apply_threshold: !no_threshold,
                })
                .await?;
            print_json(&outcome)
        }
        Command::Plan { query, aux } => {
            print_json(&app.resolver.preview(&query, aux.as_deref()).await?)
        }
        Command::Ingest { path } => {
            let parsed = procedures::load_procedures(&path).await?;
            let stored = app.procedures.ingest(parsed).await?;
            println!("ingested {} procedure(s)", stored.len());
            print_json(&stored)
        }
        Command::Procedures(ProceduresCommand::List) => print_json(&app.procedures.list().await?),
        Command::Procedures(ProceduresCommand::Delete { id }) => {
            app.procedures.delete(&id).await?;
            println!("deleted procedure {id}");
            Ok(())
        }
        Command::Procedures(ProceduresCommand::Draft { file, ingest }) => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("read {}", file.display()))?;
            let draft =
                procedures::draft_procedure(app.structurer.as_ref(), &app.scripts, &text).await?;
            if ingest {
                print_json(&app.procedures.ingest(vec![draft]).await?)
            } else {
                print_json(&draft)
            }
        }
        Command::Scripts(cmd) => run_scripts(&app, cmd).await,
        Command::Incidents(IncidentsCommand::Add { file }) => {
            let raw: serde_json::Value = read_json(&file).await?;
            let incidents: Vec<Incident> = if raw.is_array() {
                serde_json::from_value(raw)?
            } else {
                vec![serde_json::from_value(raw)?]
            };
            let mut added = Vec::with_capacity(incidents.len());
            for incident in incidents {
                added.push(app.db.add_incident(incident).await?);
            }
            print_json(&added)
        }
        Command::Incidents(IncidentsCommand::List { status }) => {
            let status = IncidentStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("unknown incident status {status:?}"))?;
            print_json(&app.db.list_incidents_with_status(status).await?)
        }
        Command::Feedback(FeedbackCommand::Submit { file }) => {
            let submission: FeedbackSubmission = read_json(&file).await?;
            let id = app.feedback.submit(&submission).await?;
            println!("recorded feedback {id}");
            Ok(())
        }
        Command::Feedback(FeedbackCommand::Stats) => print_json(&app.feedback.analyze().await?),
        Command::Feedback(FeedbackCommand::Warm) => print_json(&app.feedback.warm().await?),
        Command::History {
            incident: Some(number),
            ..
        } => match app.db.latest_history(&number).await? {
            Some(entry) => print_json(&entry),
            None => Err(anyhow::anyhow!("no history for incident {number}")),
        },
        Command::History { page, limit, .. } => print_json(&app.db.list_history(page, limit).await?),
        Command::Thresholds(ThresholdsCommand::Show) => {
            let t = app.thresholds.refresh().await;
            print_json(&std::collections::BTreeMap::from([
                (thresholds::INITIAL_SEARCH_THRESHOLD, t.initial),
                (thresholds::HYDE_SEARCH_THRESHOLD, t.hyde),
            ]))
        }
        Command::Thresholds(ThresholdsCommand::Set { key, value }) => {
            let key = key.trim().to_ascii_uppercase();
            let parsed = parse_threshold_setting(&key, &value)?;
            app.db.put_setting(&key, &parsed.to_string()).await?;
            println!("{key} = {parsed}");
            Ok(())
        }
        Command::Activity { page, limit } => print_json(&app.db.list_activity(page, limit).await?),
    }
}

async fn run_scripts(app: &App, cmd: ScriptsCommand) -> anyhow::Result<()> {
    match cmd {
        ScriptsCommand::List => print_json(&app.db.list_scripts().await?),
        ScriptsCommand::Add { file } => print_json(&app.scripts.add(read_toml(&file).await?).await?),
        ScriptsCommand::Update { id, file } => match app.scripts.update(id, read_toml(&file).await?).await? {
            Some(script) => print_json(&script),
            None => Err(anyhow::anyhow!("script {id} not found")),
        },
        ScriptsCommand::Delete { id } => {
            if !app.scripts.delete(id).await? {
                anyhow::bail!("script {id} not found");
            }
            println!("deleted script {id}");
            Ok(())
        }
        ScriptsCommand::Match { description } => {
            print_json(&app.scripts.match_description(&description).await?)
        }
        ScriptsCommand::Sync => print_json(&app.scripts.sync().await?),
        ScriptsCommand::Run { name, params } => {
            let params = params
                .iter()
                .map(|raw| runner::parse_param_assignment(raw))
                .collect::<anyhow::Result<iira_tools::ParamValues>>()?;
            let result = app.runner.run(&name, params).await?;
            print_json(&result)?;
            if !result.is_success() {
                anyhow::bail!("script {name} failed");
            }
            Ok(())
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

async fn read_toml(path: &Path) -> anyhow::Result<NewScript> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_dotenv() {
    for file in [".env", ".env.local"] {
        let _ = dotenvy::from_filename(file);
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("info,iira=debug,iira_app=debug,iira_llm=debug,iira_tools=debug"),
    };
    let log_format = std::env::var("IIRA_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported IIRA_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
