use std::collections::BTreeMap;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use suite_scheduler::backend::InMemoryLab;
use suite_scheduler::config::SchedulerConfig;
use suite_scheduler::shutdown::install_shutdown_handler;
use suite_scheduler::suite::{Priority, SuiteDispatcher, SuiteOutcome, SuiteSpec, SuiteTest};
use suite_scheduler::worker::{DryRunExecutor, OutcomeScript};

#[derive(Parser, Debug)]
#[command(name = "suite-scheduler")]
#[command(version)]
#[command(about = "Dispatch test suites to lab DUTs and collect their results")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate suite arguments and print the resulting suite spec
    Spec {
        #[command(flatten)]
        suite: SuiteArgs,
    },

    /// Run a suite against an in-memory lab with fake test commands
    DryRun(DryRunArgs),
}

// =============================================================================
// Suite Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SuiteArgs {
    /// Board to run the suite on
    #[arg(long)]
    board: String,

    /// Build to test, e.g. "eve-release/R70-11011.0.0"
    #[arg(long)]
    build: String,

    /// Name of the suite to run
    #[arg(long)]
    suite_name: String,

    /// Pool of DUTs to run the suite in
    #[arg(long, default_value = "suites")]
    pool: String,

    /// Priority by level name (e.g. "cq", "weekly") or number
    #[arg(long, default_value = "140")]
    priority: Priority,

    /// Extra keyvals for every child job, "k1=v1,k2=v2"
    #[arg(long, default_value = "")]
    job_keyvals: String,

    /// Minimum number of DUTs required to start the suite
    #[arg(long, default_value = "1")]
    minimum_duts: usize,

    /// Minutes to wait for results before giving up
    #[arg(long, default_value = "90")]
    timeout_mins: u64,

    /// Retry failed tests
    #[arg(long)]
    test_retry: bool,

    /// Maximum retries per test
    #[arg(long, default_value = "0")]
    max_retries: u32,

    /// Owner recorded on created jobs
    #[arg(long, default_value = "autotest_system")]
    owner: String,
}

#[derive(Parser, Debug)]
struct DryRunArgs {
    #[command(flatten)]
    suite: SuiteArgs,

    /// Tests in the suite (comma-separated)
    #[arg(long, default_value = "dummy_Pass")]
    tests: String,

    /// Tests that always fail (comma-separated)
    #[arg(long, default_value = "")]
    fail: String,

    /// Tests that fail once, then pass (comma-separated)
    #[arg(long, default_value = "")]
    flaky: String,

    /// Number of DUTs in the fake lab
    #[arg(long, default_value = "4")]
    duts: usize,

    /// Result poll interval in milliseconds
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SuiteRunOutput<'a> {
    success: bool,
    #[serde(flatten)]
    outcome: &'a SuiteOutcome,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Parse "k1=v1,k2=v2". Empty input gives an empty map.
fn parse_keyvals(input: &str) -> Result<BTreeMap<String, String>, String> {
    let mut keyvals = BTreeMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                keyvals.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => return Err(format!("invalid keyval {:?}, expected key=value", pair)),
        }
    }
    Ok(keyvals)
}

fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn build_spec(args: &SuiteArgs) -> Result<SuiteSpec, Box<dyn std::error::Error>> {
    let mut builder = SuiteSpec::builder(&args.suite_name)
        .build_for(&args.board, &args.build)
        .pool(&args.pool)
        .priority(args.priority)
        .minimum_duts(args.minimum_duts)
        .timeout_mins(args.timeout_mins)
        .test_retry(args.test_retry)
        .max_retries(args.max_retries);
    for (key, value) in parse_keyvals(&args.job_keyvals)? {
        builder = builder.job_keyval(key, value);
    }
    Ok(builder.build()?)
}

fn print_outcome(outcome: &SuiteOutcome, output_format: &OutputFormat) -> serde_json::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let output = SuiteRunOutput {
                success: outcome.is_success(),
                outcome,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Suite {} (id {})", outcome.suite_name, outcome.suite_id);
            println!("{}", "=".repeat(60));
            println!("{:<30} {:<12} {:<8} JOBS", "TEST", "BOARD", "STATUS");
            println!("{}", "-".repeat(60));
            for test in &outcome.tests {
                let status = test
                    .final_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "NONE".to_string());
                let jobs: Vec<String> = test.job_ids.iter().map(u64::to_string).collect();
                println!(
                    "{:<30} {:<12} {:<8} {}",
                    test.test,
                    test.board,
                    status,
                    jobs.join(",")
                );
            }
            println!();
            if outcome.timed_out {
                println!("Suite timed out");
            }
            println!(
                "Result: {}",
                if outcome.is_success() { "PASSED" } else { "FAILED" }
            );
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

fn handle_spec(args: SuiteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let spec = build_spec(&args)?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

async fn handle_dry_run(args: DryRunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let spec = build_spec(&args.suite)?;
    let tests: Vec<SuiteTest> = parse_list(&args.tests)
        .into_iter()
        .map(SuiteTest::new)
        .collect();
    if tests.is_empty() {
        return Err("at least one test is required".into());
    }

    let mut script = OutcomeScript::new();
    for test in parse_list(&args.fail) {
        script = script.failing(test);
    }
    for test in parse_list(&args.flaky) {
        script = script.flaky(test);
    }

    let lab = InMemoryLab::new();
    for board in spec.builds().keys() {
        lab.add_duts(board, spec.pool(), args.duts).await;
    }

    let shutdown = install_shutdown_handler();
    let executor = DryRunExecutor::new(lab.clone(), script);
    let executor_handle = tokio::spawn(executor.run(shutdown.child_token()));

    let config = SchedulerConfig::default()
        .with_owner(&args.suite.owner)
        .with_poll_interval_ms(args.poll_interval_ms);
    let dispatcher = SuiteDispatcher::new(lab, config);

    tracing::info!(
        suite = spec.suite_name(),
        board = %args.suite.board,
        tests = tests.len(),
        "Starting dry run"
    );

    let outcome = tokio::select! {
        outcome = dispatcher.run(&spec, &tests) => outcome?,
        _ = shutdown.cancelled() => {
            return Err("suite run interrupted".into());
        }
    };

    shutdown.cancel();
    let executed = executor_handle.await?;
    tracing::debug!(executed, "Executor stopped");

    print_outcome(&outcome, &args.output)?;
    Ok(outcome.is_success())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Spec { suite } => handle_spec(suite)?,
        Commands::DryRun(dry_run_args) => {
            if !handle_dry_run(dry_run_args).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
