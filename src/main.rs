use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mutant_runner::{
    ExecutionJob, JobOptions, MavenConfig, MavenProject, Mutant,
};

#[derive(Debug, Parser)]
#[command(name = "mutant-runner")]
#[command(about = "Execute pre-generated source mutants against a Maven project")]
struct Cli {
    /// Maven project working directory.
    #[arg(long)]
    project: PathBuf,
    /// JSON file holding the mutants to execute.
    #[arg(long)]
    mutants: PathBuf,
    /// Output directory for the result CSV and progress log.
    #[arg(long)]
    out: PathBuf,
    /// Directory where project replicas are materialized.
    /// Defaults to `<out>/replicas`.
    #[arg(long)]
    replicas: Option<PathBuf>,
    /// Maximum parallel workers (and replicas).
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Target tests for every mutant, e.g. `pkg.ClsTest#method,pkg.OtherTest`.
    #[arg(long)]
    tests: Option<String>,
    /// JSON file mapping relative source paths to their target tests.
    /// Overrides `--tests` for mutants of those files.
    #[arg(long)]
    file_tests: Option<PathBuf>,
    /// Per-invocation test timeout in seconds.
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,
    /// JAVA_HOME exported to Maven invocations.
    #[arg(long)]
    jdk: Option<PathBuf>,
    /// M2_HOME exported to Maven invocations.
    #[arg(long)]
    maven_home: Option<PathBuf>,
    /// Remove the base project's working directory when the job ends.
    #[arg(long)]
    remove_project: bool,
    /// Re-run even when a prior job already treated every mutant.
    #[arg(long)]
    force: bool,
}

fn load_mutants(path: &PathBuf) -> Result<Vec<Mutant>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading mutants file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing mutants file {}", path.display()))
}

fn load_file_tests(path: &PathBuf) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading file-tests map {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing file-tests map {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mutants = load_mutants(&cli.mutants)?;
    let mut options = JobOptions::default()
        .with_max_workers(cli.workers)
        .with_remove_project_on_exit(cli.remove_project);
    if let Some(tests) = cli.tests {
        options = options.with_tests(tests);
    }
    if let Some(path) = &cli.file_tests {
        options.file_tests = load_file_tests(path)?;
    }

    let mut config = MavenConfig::default()
        .with_tests_timeout(Duration::from_secs(cli.timeout_secs));
    if let Some(jdk) = cli.jdk {
        config = config.with_jdk_home(jdk);
    }
    if let Some(m2) = cli.maven_home {
        config = config.with_maven_home(m2);
    }

    let replicas_root = cli.replicas.unwrap_or_else(|| cli.out.join("replicas"));
    let base = MavenProject::new(&cli.project, &replicas_root, config);

    let mut job = ExecutionJob::new(Box::new(base), &cli.out, options)?;
    if job.has_executed() && !cli.force {
        println!("already executed: every requested mutant is recorded (use --force to re-run)");
        return Ok(());
    }

    let summary = job.process_mutants(mutants)?;
    println!("requested: {}", summary.requested);
    println!("skipped (already recorded): {}", summary.skipped);
    println!("processed: {}", summary.processed);
    println!(
        "compile_failed={}, passed={}, failed={}, timed_out={}",
        summary.compile_failed, summary.passed, summary.failed, summary.timed_out
    );
    println!("results: {}", job.sink().path().display());
    Ok(())
}
