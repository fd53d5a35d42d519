mod config;

use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vigil_eval::{
    AliasTable, CompileContext, CompiledRule, DomainControllerSet, Engine, Evaluation,
    StructuredEvent,
};
use vigil_rules::{RuleLibrary, parse_rule_condition, parse_rule_directory, parse_rule_file};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Validate detection rules and evaluate audit events against them")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./vigil.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile every rule in a file or directory and report results
    Validate {
        /// Path to a rule file or a directory of rules
        path: PathBuf,

        /// List each rejected rule (not just the summary)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Parse a condition expression and print the tree as JSON
    Condition {
        /// The condition expression to parse
        expr: String,
    },

    /// Evaluate events against rules
    ///
    /// Events are given as a single JSON string (--event) or as NDJSON
    /// (newline-delimited JSON) on stdin. Aggregation rules only report how
    /// many candidates each event produced.
    Eval {
        /// Path to a rule file or directory of rules
        #[arg(short, long)]
        rules: PathBuf,

        /// A single event as a JSON string (if omitted, reads NDJSON from stdin)
        #[arg(short, long)]
        event: Option<String>,

        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Print the windowed count query of every aggregation rule
    Query {
        /// Path to a rule file or directory of rules
        #[arg(short, long)]
        rules: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let cfg = match AppConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };
    init_logging(&cfg.logging.level);

    match cli.command {
        Commands::Validate { path, verbose } => cmd_validate(&cfg, path, verbose),
        Commands::Condition { expr } => cmd_condition(expr),
        Commands::Eval {
            rules,
            event,
            pretty,
        } => cmd_eval(&cfg, rules, event, pretty),
        Commands::Query { rules } => cmd_query(&cfg, rules),
    }
}

/// Logs go to stderr; `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_validate(cfg: &AppConfig, path: PathBuf, verbose: bool) {
    let library = load_library(&path);
    let documents = library.document_count();
    let parse_errors = library.errors.len();

    let engine = build_engine(cfg);
    let report = engine.load_library(&library);
    let rules = engine.snapshot();
    let aggregations = rules.rules().iter().filter(|r| r.is_aggregation()).count();

    println!("Parsed {documents} documents from {}", path.display());
    println!("  Standard rules:    {}", rules.len() - aggregations);
    println!("  Aggregation rules: {aggregations}");
    println!("  Parse errors:      {parse_errors}");
    println!("  Compile errors:    {}", report.errors.len() - parse_errors);

    if verbose && !report.errors.is_empty() {
        println!("\nErrors:");
        for err in &report.errors {
            println!("  - {err}");
        }
    }

    if !report.errors.is_empty() {
        process::exit(1);
    }
}

fn cmd_condition(expr: String) {
    match parse_rule_condition(&expr) {
        Ok(parsed) => print_json(&parsed, true),
        Err(e) => {
            eprintln!("Condition parse error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_eval(cfg: &AppConfig, rules_path: PathBuf, event_json: Option<String>, pretty: bool) {
    let engine = compiled_engine(cfg, &rules_path);
    let rules = engine.snapshot();
    eprintln!("Loaded {} rules from {}", rules.len(), rules_path.display());

    if let Some(json_str) = event_json {
        let Some(event) = parse_event(&json_str) else {
            eprintln!("Invalid JSON event: expected an object");
            process::exit(1);
        };
        let evaluation = rules.evaluate(&event);
        if evaluation.detections.is_empty() && evaluation.candidates.is_empty() {
            eprintln!("No matches.");
        }
        let mut candidates = BTreeMap::new();
        report(&evaluation, pretty, &mut candidates);
        print_candidates(&candidates);
        return;
    }

    let stdin = io::stdin();
    let mut line_num = 0u64;
    let mut match_count = 0u64;
    let mut candidates: BTreeMap<String, u64> = BTreeMap::new();

    for line in stdin.lock().lines() {
        line_num += 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading line {line_num}: {e}");
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let Some(event) = parse_event(&line) else {
            eprintln!("Invalid JSON on line {line_num}");
            continue;
        };

        let evaluation = rules.evaluate(&event);
        match_count += evaluation.detections.len() as u64;
        report(&evaluation, pretty, &mut candidates);
    }

    eprintln!("Processed {line_num} events, {match_count} matches.");
    print_candidates(&candidates);
}

fn cmd_query(cfg: &AppConfig, rules_path: PathBuf) {
    let engine = compiled_engine(cfg, &rules_path);
    let rules = engine.snapshot();
    let mut printed = 0;
    for rule in rules.rules() {
        if let CompiledRule::Aggregation(agg) = rule.as_ref() {
            println!(
                "{} [{}s]: {}",
                agg.core.key,
                agg.aggregation.window.as_secs(),
                agg.aggregation.query(|_| true)
            );
            printed += 1;
        }
    }
    if printed == 0 {
        eprintln!("No aggregation rules.");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_library(path: &Path) -> RuleLibrary {
    let result = if path.is_dir() {
        parse_rule_directory(path)
    } else {
        parse_rule_file(path).map(|definition| RuleLibrary {
            definitions: vec![definition],
            errors: Vec::new(),
        })
    };
    match result {
        Ok(library) => library,
        Err(e) => {
            eprintln!("Error reading rules from {}: {e}", path.display());
            process::exit(1);
        }
    }
}

/// Load rules and stop on the first rejected one.
fn compiled_engine(cfg: &AppConfig, path: &Path) -> Engine {
    let library = load_library(path);
    let engine = build_engine(cfg);
    let report = engine.load_library(&library);
    if !report.errors.is_empty() {
        for err in &report.errors {
            eprintln!("Error compiling rules: {err}");
        }
        process::exit(1);
    }
    engine
}

fn build_engine(cfg: &AppConfig) -> Engine {
    let mut context = CompileContext::new();
    if let Some(path) = &cfg.aliases_path {
        let aliases: AliasTable = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(aliases) => aliases,
            Err(e) => {
                eprintln!("Error loading aliases from {}: {e}", path.display());
                process::exit(1);
            }
        };
        tracing::debug!(aliases = aliases.len(), "loaded field aliases");
        context = context.with_aliases(aliases);
    }
    if let Some(path) = &cfg.domain_controllers_path {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("Error loading domain controllers from {}: {e}", path.display());
                process::exit(1);
            }
        };
        let dcs: DomainControllerSet = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        tracing::debug!(hosts = dcs.len(), "loaded domain controllers");
        context = context.with_domain_controllers(dcs);
    }
    Engine::from_config(context, &cfg.engine)
}

fn parse_event(json: &str) -> Option<StructuredEvent> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    StructuredEvent::from_json(&value)
}

fn report(evaluation: &Evaluation, pretty: bool, candidates: &mut BTreeMap<String, u64>) {
    for m in &evaluation.detections {
        print_json(m, pretty);
    }
    for c in &evaluation.candidates {
        *candidates.entry(c.rule_key.clone()).or_default() += 1;
    }
}

fn print_candidates(candidates: &BTreeMap<String, u64>) {
    for (rule, count) in candidates {
        eprintln!("Aggregation candidates for {rule}: {count}");
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) {
    let result = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match result {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("JSON serialization error: {e}"),
    }
}
