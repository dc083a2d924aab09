//! Command-line driver for the mailrlm engine.
//!
//! Loads a pre-fetched corpus, runs a built-in analysis against it, and
//! prints the result (or the full JSON envelope with `--json-output`).
//! Exit codes: 0 success, 1 program error, 2 configuration error, 3 budget
//! exceeded without a FINAL, 4 backend unavailable.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mailrlm_engine::analyses;
use mailrlm_engine::Corpus;
use mailrlm_engine::EngineConfig;
use mailrlm_engine::EngineError;
use mailrlm_engine::ResultEnvelope;
use mailrlm_engine::Runtime;
use mailrlm_engine::Session;
use mailrlm_engine::SessionStats;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mailrlm",
    version,
    about = "Run recursive language model analyses over an email corpus"
)]
struct Cli {
    /// Corpus JSON file produced by the corpus loader
    #[arg(long, value_name = "PATH")]
    load_file: Option<PathBuf>,

    /// Built-in analysis to run (see --list-analyses)
    #[arg(long, value_name = "NAME")]
    analysis: Option<String>,

    /// List built-in analyses and exit
    #[arg(long)]
    list_analyses: bool,

    /// Optional TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Maximum spend in USD
    #[arg(long, value_name = "USD")]
    max_budget: Option<f64>,

    /// Maximum number of LLM calls
    #[arg(long)]
    max_calls: Option<u64>,

    /// Maximum recursion/fan-out depth
    #[arg(long)]
    max_depth: Option<u64>,

    /// Maximum concurrent workers per fan-out
    #[arg(long)]
    max_workers: Option<usize>,

    /// Model override (otherwise backend discovery decides)
    #[arg(long)]
    model: Option<String>,

    /// Pin a specific local OpenAI-compatible base URL
    #[arg(long, value_name = "URL")]
    local_url: Option<String>,

    /// Force the remote backend even when a local endpoint answers
    #[arg(long)]
    force_remote: bool,

    /// Bypass the query cache for this run
    #[arg(long)]
    no_cache: bool,

    /// Emit the full JSON result envelope on stdout
    #[arg(long)]
    json_output: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;

    if let Some(max_budget) = cli.max_budget {
        config.budget.max_budget_usd = max_budget;
    }
    if let Some(max_calls) = cli.max_calls {
        config.budget.max_calls = max_calls;
    }
    if let Some(max_depth) = cli.max_depth {
        config.budget.max_depth = max_depth;
    }
    if let Some(max_workers) = cli.max_workers {
        config.pool.max_workers = max_workers.max(1);
    }
    if let Some(model) = &cli.model {
        config.backend.model = Some(model.clone());
    }
    if let Some(local_url) = &cli.local_url {
        config.backend.local_base_url = Some(local_url.clone());
    }
    config.backend.force_remote = config.backend.force_remote || cli.force_remote;
    config.cache.bypass = config.cache.bypass || cli.no_cache;
    Ok(config)
}

/// Report a fatal pre-run error the same way a failed run is reported.
fn emit_fatal(err: &EngineError, json_output: bool) -> i32 {
    if json_output {
        let envelope = ResultEnvelope::error(err, String::new(), SessionStats::default());
        println!("{}", envelope.to_json());
    } else {
        eprintln!("error: {err}");
    }
    err.exit_code()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    if cli.list_analyses {
        for analysis in analyses::builtin_analyses() {
            println!("{:<20} {}", analysis.name, analysis.description);
        }
        return 0;
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => return emit_fatal(&err, cli.json_output),
    };

    let Some(load_file) = &cli.load_file else {
        let err = EngineError::configuration("--load-file is required");
        return emit_fatal(&err, cli.json_output);
    };
    let corpus = match Corpus::from_json_file(load_file) {
        Ok(corpus) => corpus,
        Err(err) => {
            // A corpus that cannot be loaded is a configuration problem.
            let err = EngineError::configuration(err.to_string());
            return emit_fatal(&err, cli.json_output);
        }
    };
    tracing::info!(
        emails = corpus.len(),
        query = %corpus.metadata.query,
        "corpus loaded"
    );

    let Some(name) = &cli.analysis else {
        let err = EngineError::configuration("--analysis is required (see --list-analyses)");
        return emit_fatal(&err, cli.json_output);
    };
    let Some(program) = analyses::lookup(name) else {
        let err = EngineError::configuration(format!(
            "unknown analysis '{name}' (see --list-analyses)"
        ));
        return emit_fatal(&err, cli.json_output);
    };

    let session = match Session::start(config).await {
        Ok(session) => Arc::new(session),
        Err(err) => return emit_fatal(&err, cli.json_output),
    };

    let runtime = Runtime::new(session, Arc::new(corpus));
    let outcome = runtime.execute(program).await;

    if cli.json_output {
        println!("{}", outcome.envelope.to_json());
    } else {
        for warning in &outcome.envelope.warnings {
            eprintln!("warning: {warning}");
        }
        match (&outcome.envelope.result, &outcome.envelope.message) {
            (Some(serde_json::Value::String(text)), _) => println!("{text}"),
            (Some(value), _) => println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_default()
            ),
            (None, Some(message)) => eprintln!("error: {message}"),
            (None, None) => {}
        }
    }

    outcome.exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("mailrlm").chain(args.iter().copied()))
    }

    #[test]
    fn flags_land_in_config() {
        let cli = parse(&[
            "--load-file",
            "/tmp/emails.json",
            "--analysis",
            "inbox_triage",
            "--max-budget",
            "0.25",
            "--max-calls",
            "7",
            "--max-depth",
            "3",
            "--max-workers",
            "2",
            "--no-cache",
            "--force-remote",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.budget.max_budget_usd, 0.25);
        assert_eq!(config.budget.max_calls, 7);
        assert_eq!(config.budget.max_depth, 3);
        assert_eq!(config.pool.max_workers, 2);
        assert!(config.cache.bypass);
        assert!(config.backend.force_remote);
    }

    #[test]
    fn config_file_feeds_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailrlm.toml");
        std::fs::write(
            &path,
            "[budget]\nmax_calls = 9\n\n[pool]\nmax_workers = 3\n",
        )
        .unwrap();

        let cli = parse(&["--config", path.to_str().unwrap()]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.budget.max_calls, 9);
        assert_eq!(config.pool.max_workers, 3);
    }

    #[test]
    fn zero_workers_clamps_to_one() {
        let cli = parse(&["--max-workers", "0"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.pool.max_workers, 1);
    }
}
