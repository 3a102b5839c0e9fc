//! suiterun CLI - declarative test orchestration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use suiterun::report::{ConsoleReporter, LogReporter, print_summary};
use suiterun::{Criteria, Runner, StepRegistry, Suite};

#[derive(Parser)]
#[command(name = "suiterun")]
#[command(about = "Declarative test orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Suite file path
    #[arg(short, long, global = true, default_value = "suite.yaml")]
    suite: PathBuf,

    /// Override a suite setting (repeatable), e.g. --set threads=4
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_key_val)]
    overrides: Vec<(String, String)>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Number of worker threads
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Number of times to run the suite
        #[arg(short = 'n', long)]
        iterations: Option<usize>,

        /// Root directory for test output
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Print the result tree as JSON instead of the console report
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        filters: Filters,
    },

    /// List the tests a run would execute
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        #[command(flatten)]
        filters: Filters,
    },

    /// Resolve the suite and report every problem found
    Validate,
}

#[derive(Args, Debug, Default)]
struct Filters {
    /// Select tests by exact name (repeatable)
    #[arg(short = 't', long = "test")]
    tests: Vec<String>,

    /// Select tests whose name matches a regex (repeatable)
    #[arg(short = 'r', long = "regex")]
    regexes: Vec<String>,

    /// Select tests in a group (repeatable)
    #[arg(short = 'g', long = "group")]
    groups: Vec<String>,

    /// Exclude tests in a group (repeatable)
    #[arg(short = 'x', long = "exclude-group")]
    exclude_groups: Vec<String>,
}

impl Filters {
    fn criteria(&self) -> Result<Criteria> {
        let mut criteria = Criteria::all();
        for name in &self.tests {
            criteria = criteria.name(name.as_str());
        }
        for pattern in &self.regexes {
            let regex = regex::Regex::new(pattern)
                .with_context(|| format!("Invalid test pattern '{}'", pattern))?;
            criteria = criteria.name(regex);
        }
        for group in &self.groups {
            criteria = criteria.group(group.as_str());
        }
        for group in &self.exclude_groups {
            criteria = criteria.exclude_group(group.as_str());
        }
        Ok(criteria)
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let overrides: BTreeMap<String, String> = cli.overrides.iter().cloned().collect();

    match cli.command {
        Commands::Run {
            threads,
            iterations,
            output_dir,
            json,
            filters,
        } => {
            let options = RunOptions {
                threads,
                iterations,
                output_dir,
                json,
                verbose: cli.verbose,
            };
            run_tests(&cli.suite, &overrides, options, &filters).await
        }
        Commands::List { format, filters } => list_tests(&cli.suite, &overrides, &format, &filters),
        Commands::Validate => validate_suite(&cli.suite, &overrides),
    }
}

fn load_suite(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Suite> {
    let suite = suiterun::resolve_suite_with(path, overrides)
        .with_context(|| format!("Failed to load suite from {}", path.display()))?;
    info!("Loaded suite from {}", path.display());
    Ok(suite)
}

struct RunOptions {
    threads: Option<usize>,
    iterations: Option<usize>,
    output_dir: Option<PathBuf>,
    json: bool,
    verbose: bool,
}

async fn run_tests(
    suite_path: &Path,
    overrides: &BTreeMap<String, String>,
    options: RunOptions,
    filters: &Filters,
) -> Result<()> {
    let suite = load_suite(suite_path, overrides)?;
    let criteria = filters.criteria()?;

    if matches!(options.threads, Some(0)) || matches!(options.iterations, Some(0)) {
        bail!("--threads and --iterations must be at least 1");
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping tests...");
            signal_token.cancel();
        }
    });

    let json = options.json;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut runner = Runner::new(&suite, StepRegistry::with_builtins()).with_cancellation_token(token);
        if let Some(threads) = options.threads {
            runner = runner.with_threads(threads);
        }
        if let Some(iterations) = options.iterations {
            runner = runner.with_iterations(iterations);
        }
        if let Some(dir) = options.output_dir {
            runner = runner.with_output_dir(dir);
        }
        runner = if options.json {
            runner.with_reporter(Box::new(LogReporter))
        } else {
            runner.with_reporter(Box::new(ConsoleReporter::new(options.verbose)))
        };
        runner.run(&criteria)
    })
    .await
    .context("Test run panicked")?;

    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            std::process::exit(result.exit_code());
        }
        Err(e) => {
            error!("{}", e);
            if json {
                println!("{}", serde_json::to_string_pretty(&e.result)?);
            } else {
                print_summary(&e.result);
            }
            std::process::exit(2);
        }
    }
}

fn list_tests(
    suite_path: &Path,
    overrides: &BTreeMap<String, String>,
    format: &str,
    filters: &Filters,
) -> Result<()> {
    let suite = load_suite(suite_path, overrides)?;
    let tests = suiterun::list_tests(&suite, &filters.criteria()?);

    match format {
        "json" => {
            let models: Vec<&suiterun::TestModel> = tests.iter().map(AsRef::as_ref).collect();
            let json = serde_json::to_string_pretty(&models)?;
            println!("{}", json);
        }
        _ => {
            println!("{} test(s):", tests.len());
            for test in &tests {
                let mut line = format!("  {}", test.name);
                if !test.groups.is_empty() {
                    line.push_str(&format!(" [{}]", test.groups.join(", ")));
                }
                if let Some(desc) = &test.short_desc {
                    line.push_str(&format!(" - {}", desc));
                }
                if let Some(err) = &test.error {
                    line.push_str(&format!(" (invalid: {})", err));
                }
                println!("{}", line);
            }
        }
    }

    Ok(())
}

fn validate_suite(suite_path: &Path, overrides: &BTreeMap<String, String>) -> Result<()> {
    let suite = match suiterun::resolve_suite_with(suite_path, overrides) {
        Ok(suite) => suite,
        Err(e) => {
            eprintln!("Suite error: {}", e);
            std::process::exit(1);
        }
    };

    let registry = StepRegistry::with_builtins();
    let mut problems = Vec::new();
    for model in suite.models() {
        if let Some(err) = &model.error {
            problems.push(format!("{}: {}", model.name, err));
            continue;
        }
        for step in model.pre_run.iter().chain(&model.run).chain(&model.post_run) {
            if !registry.contains(&step.kind) {
                problems.push(format!("{}: unknown step type '{}'", model.name, step.kind));
            }
        }
    }

    println!("Suite: {}", suite.path().display());
    println!("  Tests: {}", suite.models().iter().filter(|m| !m.is_abstract).count());
    println!("  Permutations: {}", suite.permutations().len());
    println!("  Resource pools: {}", suite.document().resources.len());
    println!("  Threads: {}", suite.settings().threads);
    println!("  Iterations: {}", suite.settings().iterations);

    if !problems.is_empty() {
        println!();
        println!("{} problem(s):", problems.len());
        for problem in &problems {
            println!("  - {}", problem);
        }
        std::process::exit(1);
    }

    println!("Suite is valid.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("threads=4"),
            Ok(("threads".to_string(), "4".to_string()))
        );
        assert_eq!(
            parse_key_val("label=a=b"),
            Ok(("label".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_val("threads").is_err());
        assert!(parse_key_val("=4").is_err());
    }

    #[test]
    fn test_filters_reject_bad_regex() {
        let filters = Filters {
            regexes: vec!["(".to_string()],
            ..Filters::default()
        };
        assert!(filters.criteria().is_err());
    }
}
