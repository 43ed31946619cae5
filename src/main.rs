use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

use task_judge::cache::CacheStore;
use task_judge::config::{LimitResolver, TaskConfig};
use task_judge::core::utils::sha256_files;
use task_judge::core::{cancel_pair, GroupId};
use task_judge::engine::{
    compile_log_path, compile_with_dependencies, Backend, Checker, CompiledSolution, ToolchainCompiler,
};
use task_judge::package::Package;
use task_judge::scheduler::{render_table, restore_terminal, LogHold, Reporter, Scheduler, TableView};
use task_judge::validator::{dump_expected_scores, RunScope, Validator};

/// Process exit codes
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    /// 128 + SIGINT
    pub const CANCELLED: u8 = 130;
}

#[derive(Parser)]
#[command(name = "task-judge")]
#[command(about = "Task Judge - run solutions of a task package and check their expected scores", long_about = None)]
struct Cli {
    /// Package directory
    #[arg(short, long, default_value = ".")]
    package: PathBuf,

    /// Solutions to run (default: all in prog/)
    #[arg(short, long, num_args = 1..)]
    solutions: Option<Vec<String>>,

    /// Tests to run (default: all in in/)
    #[arg(short, long, num_args = 1..)]
    tests: Option<Vec<String>>,

    /// Number of parallel workers (default: all cores)
    #[arg(short, long, env = "TASK_JUDGE_CPUS")]
    cpus: Option<usize>,

    /// Measurement backend
    #[arg(long, value_enum, default_value_t = Backend::Time)]
    backend: Backend,

    /// Path to GNU time
    #[arg(long, env = "TASK_JUDGE_TIME_TOOL")]
    time_tool: Option<PathBuf>,

    /// Path to sio2jail
    #[arg(long, env = "SIO2JAIL_PATH")]
    sio2jail_path: Option<PathBuf>,

    /// Time limit override in seconds
    #[arg(long, value_parser = positive_number)]
    tl: Option<f64>,

    /// Memory limit override in MB
    #[arg(long, value_parser = positive_number)]
    ml: Option<f64>,

    /// C compiler
    #[arg(long, alias = "c_compiler_path", default_value = "gcc")]
    c_compiler_path: String,

    /// C++ compiler
    #[arg(long, alias = "cpp_compiler_path", default_value = "g++")]
    cpp_compiler_path: String,

    /// Python interpreter
    #[arg(long, alias = "python_interpreter_path", default_value = "/usr/bin/python3")]
    python_interpreter_path: String,

    /// Leave the memory rows out of the results table
    #[arg(long, alias = "hide_memory")]
    hide_memory: bool,

    /// Rewrite expected scores in config.yml to match the results
    #[arg(long)]
    apply_suggestions: bool,

    /// Also write the final table to this file
    #[arg(long)]
    solutions_report: Option<PathBuf>,
}

/// Limit overrides must be positive, finite numbers
fn positive_number(value: &str) -> Result<f64, String> {
    let number: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if !number.is_finite() || number <= 0.0 {
        return Err(format!("{} is not a positive number", value));
    }
    Ok(number)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let log = LogHold::default();
    tracing_subscriber::fmt()
        .with_writer(log.clone())
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("task_judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = run(cli, log).await?;
    Ok(ExitCode::from(code))
}

async fn run(cli: Cli, log: LogHold) -> Result<u8> {
    let config_path = cli.package.join(task_judge::config::CONFIG_FILE);
    let mut config = TaskConfig::load(&config_path)?;
    let contest = config.contest_type()?;
    contest.verify_config(config.scores.as_ref(), config.total_score)?;

    let package = Package::new(&cli.package, &config)?;
    info!("Task {} ({} contest)", package.task_id, contest);

    let all_tests = package.tests(None)?;
    let tests = package.tests(cli.tests.as_deref())?;
    let sources = package.solutions(cli.solutions.as_deref())?;
    if tests.is_empty() {
        bail!("No tests found in {:?}", package.root.join("in"));
    }

    let groups: Vec<GroupId> = all_tests
        .iter()
        .map(|t| t.group)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let weights = config.weights(contest, &groups);
    let validator = Validator::new(&weights);
    validator.check_weights(&groups, &config.sinol_expected_scores)?;

    let limits = LimitResolver::new(
        &config,
        cli.tl.map(|seconds| (seconds * 1000.0).round() as u64),
        cli.ml.map(|mb| (mb * 1024.0).round() as u64),
    );
    for test in &tests {
        limits.time_limit(test)?;
        limits.memory_limit(test)?;
    }

    let cache = CacheStore::open(package.cache_dir())?;
    let compiler = ToolchainCompiler {
        c_compiler: cli.c_compiler_path.clone(),
        cpp_compiler: cli.cpp_compiler_path.clone(),
        python_interpreter: cli.python_interpreter_path.clone(),
        include_dirs: Vec::new(),
    }
    .with_include_dir(package.prog_dir());

    let libraries = package.library_files()?;
    let library_refs: Vec<&Path> = libraries.iter().map(PathBuf::as_path).collect();
    let dependency_hash = sha256_files(&library_refs)?;

    let checker = match package.checker_source() {
        Some(source) => {
            let compiled = compile_with_dependencies(&compiler, &cache, &source, &dependency_hash).await?;
            let Some(executable) = compiled.executable else {
                print_compile_log(&cache, &source);
                bail!("Checker {} failed to compile", compiled.name);
            };
            // Header changes rebuild the checker and invalidate its verdicts
            let checker_hash = format!("{}+{}", compiled.source_hash, dependency_hash);
            Some((Checker::new(executable), checker_hash))
        }
        None => None,
    };
    cache.sync_markers(contest.name(), checker.as_ref().map(|(_, hash)| hash.as_str()))?;

    let mut solutions: Vec<CompiledSolution> = Vec::with_capacity(sources.len());
    for source in &sources {
        let solution = compile_with_dependencies(&compiler, &cache, source, &dependency_hash).await?;
        if !solution.compiled() {
            print_compile_log(&cache, source);
        }
        solutions.push(solution);
    }

    let executor = match cli.backend {
        Backend::Time => cli.backend.executor(cli.time_tool.clone()),
        Backend::Sio2jail => cli.backend.executor(cli.sio2jail_path.clone()),
    };
    let view = TableView::new(contest, weights.clone()).with_hide_memory(cli.hide_memory);
    let mut scheduler = Scheduler::new(executor, cache, &package.root)
        .with_checker(checker.map(|(checker, _)| checker))
        .with_reporter(Reporter::new(view.clone()).with_log_hold(log));
    if let Some(cpus) = cli.cpus {
        scheduler = scheduler.with_cpus(cpus);
    }

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, stopping after the running jobs");
        cancel_handle.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            restore_terminal();
            eprintln!("Interrupted again, exiting");
            std::process::exit(exit_codes::CANCELLED.into());
        }
    });

    info!(
        "Running {} solutions on {} tests with the {} backend",
        solutions.len(),
        tests.len(),
        cli.backend
    );
    let outcome = scheduler.run(&solutions, &tests, &limits, &cancel).await?;

    if let Some(report) = &cli.solutions_report {
        std::fs::write(report, render_table(&outcome.matrix, &view, false))
            .with_context(|| format!("Failed to write report {:?}", report))?;
    }
    if outcome.cancelled {
        error!("Run cancelled");
        return Ok(exit_codes::CANCELLED);
    }

    let scores = outcome.matrix.scores(contest, &weights);
    let new_expected = validator.expectations(&scores)?;
    let scope = RunScope {
        all_solutions: cli.solutions.is_none(),
        all_tests: cli.tests.is_none(),
    };
    let diff = validator.validate(&config.sinol_expected_scores, new_expected, scope)?;

    println!("Expected scores from config:");
    println!("{}", dump_expected_scores(&diff.expected)?);
    println!("Expected scores based on results:");
    println!("{}", dump_expected_scores(&diff.new)?);
    for message in diff.messages() {
        warn!("{}", message);
    }

    if diff.is_correct() {
        info!("Expected scores are correct!");
        return Ok(exit_codes::SUCCESS);
    }
    if !cli.apply_suggestions {
        error!("Use flag --apply-suggestions to apply suggestions.");
        return Ok(exit_codes::FAILURE);
    }

    validator.apply(&diff, &mut config.sinol_expected_scores)?;
    config.save(&config_path)?;
    info!("Saved suggested expected scores description.");
    Ok(exit_codes::SUCCESS)
}

fn print_compile_log(cache: &CacheStore, source: &Path) {
    let name = source
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let log_path = compile_log_path(cache, &name);
    match std::fs::read_to_string(&log_path) {
        Ok(log) => error!("Compilation of {:?} failed:\n{}", source, log),
        Err(e) => error!("Compilation of {:?} failed, log unavailable: {}", source, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_overrides_must_be_positive() {
        assert_eq!(positive_number("0.5"), Ok(0.5));
        assert!(positive_number("-1").is_err());
        assert!(positive_number("0").is_err());
        assert!(positive_number("inf").is_err());
        assert!(positive_number("abc").is_err());
    }

    #[test]
    fn test_cli_accepts_fractional_memory_and_toolchain_paths() {
        let cli = Cli::try_parse_from([
            "task-judge",
            "--ml",
            "0.5",
            "--c_compiler_path",
            "gcc-13",
            "--cpp-compiler-path",
            "g++-13",
            "--hide_memory",
        ])
        .unwrap();
        assert_eq!(cli.ml, Some(0.5));
        assert_eq!(cli.c_compiler_path, "gcc-13");
        assert_eq!(cli.cpp_compiler_path, "g++-13");
        assert_eq!(cli.python_interpreter_path, "/usr/bin/python3");
        assert!(cli.hide_memory);

        assert!(Cli::try_parse_from(["task-judge", "--tl", "-2"]).is_err());
    }
}
