//! kyrologic CLI: consult rule files and run goals against them.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use kyrologic::profile::{load_budgets, QueryBatch};
use kyrologic::{
    AdapterSession, KbManager, KnowledgeModule, LogicError, LogicResult, ModuleRegistry, ModuleVersion,
    QueryOptions, QueryProfiler, RuntimeConfig, Tier, ValidationError,
};

#[derive(Parser)]
#[command(name = "kyrologic", version, about = "Embedded rule-based reasoning runtime")]
struct Cli {
    /// Runtime configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Module cache directory (overrides the config file).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Rule files to consult, in order. Each becomes a module named after its file stem.
    #[arg(long = "program", short = 'p', global = true)]
    programs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one goal and print the result as JSON.
    Query {
        goal: String,

        /// Stop after this many solutions.
        #[arg(long)]
        max: Option<usize>,

        /// Per-query timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run one goal and print the action proposals it yields.
    Actions { goal: String },

    /// Run a goal repeatedly under a label and print latency stats.
    Profile {
        goal: String,

        #[arg(long, default_value = "cli")]
        label: String,

        #[arg(long, default_value = "100")]
        runs: usize,

        /// Budget file (TOML `[[budgets]]` or JSON) to check against.
        #[arg(long)]
        budgets: Option<PathBuf>,
    },

    /// Show which modules loaded and where they came from.
    Modules,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> LogicResult<()> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = cli.cache_dir {
        config.cache.dir = Some(dir);
    }

    let session = AdapterSession::new(config.session.clone())?;
    let manager = load_programs(&session, &cli.programs, &config)?;

    match cli.command {
        Commands::Query { goal, max, timeout_ms } => {
            let mut opts = QueryOptions::new();
            opts.max_solutions = max;
            opts.timeout = timeout_ms.map(Duration::from_millis);
            print_json(&session.query(&goal, &opts))
        }
        Commands::Actions { goal } => {
            let proposals = session.query_host_actions_with(&goal, &QueryOptions::new())?;
            print_json(&proposals)
        }
        Commands::Profile {
            goal,
            label,
            runs,
            budgets,
        } => {
            let profiler = QueryProfiler::new(session.clone(), config.profiler.clone());
            let mut declared = config.budgets.clone();
            if let Some(path) = budgets {
                declared.extend(load_budgets(&path)?);
            }
            profiler.set_budgets(declared)?;
            let mut batch = QueryBatch::new(&session);
            for _ in 0..runs {
                // Repeats must reach the interpreter, not the query cache.
                batch.push(goal.clone(), QueryOptions::new().without_cache());
            }
            batch.run_profiled(&profiler, &label);
            print_json(&ProfileOutput {
                stats: profiler.all_stats(),
                budgets: profiler.check_budgets(),
            })
        }
        Commands::Modules => print_json(&ModulesOutput {
            session: session.id().to_string(),
            loaded: manager.loaded_modules(),
            stats: manager.stats(),
        }),
    }
}

#[derive(Serialize)]
struct ProfileOutput {
    stats: Vec<kyrologic::QueryStats>,
    budgets: kyrologic::profile::BudgetReport,
}

#[derive(Serialize)]
struct ModulesOutput {
    session: String,
    loaded: Vec<(String, ModuleVersion)>,
    stats: kyrologic::lifecycle::ManagerStats,
}

/// Registers each file as a standard-tier module and loads them in order.
fn load_programs(session: &AdapterSession, paths: &[PathBuf], config: &RuntimeConfig) -> LogicResult<KbManager> {
    let mut registry = ModuleRegistry::new();
    let mut ids = Vec::with_capacity(paths.len());
    for path in paths {
        let source = std::fs::read_to_string(path).map_err(|e| {
            LogicError::from(ValidationError::InvalidConfig {
                reason: format!("cannot read {}: {e}", path.display()),
            })
        })?;
        let id = module_id(path);
        let module = KnowledgeModule::new(id.clone(), ModuleVersion::new(0, 1, 0), Tier::Standard, source)?;
        registry.register(module)?;
        ids.push(id);
    }
    let manager = KbManager::new(
        session.clone(),
        Arc::new(registry),
        config.cache.open(),
        config.lifecycle.clone(),
    );
    for id in &ids {
        manager.request_load(id)?;
    }
    Ok(manager)
}

/// `Voice Leading.pl` -> `voice-leading`.
fn module_id(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("module");
    let mut id: String = stem
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
            _ => '-',
        })
        .collect();
    if !id.starts_with(|c: char| c.is_ascii_lowercase()) {
        id.insert(0, 'm');
    }
    id.truncate(64);
    id
}

fn print_json<T: Serialize>(value: &T) -> LogicResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| LogicError::internal(e.to_string()))?;
    println!("{text}");
    Ok(())
}
