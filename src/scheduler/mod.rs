//! Scheduler - runs every selected solution on every selected test
//!
//! Flow:
//! 1. Resolve limits and test hashes (configuration errors surface here, before any job)
//! 2. Fill the matrix from the cache, CE for solutions that did not compile
//! 3. Queue the misses in (solution, test) order and drain them with `cpus` workers
//! 4. The coordinator stores each finished result in the matrix and the cache
//!
//! Workers only execute. The coordinator is the single writer of the matrix
//! and of the cache entries, and publishes matrix snapshots for the reporter.

pub mod matrix;
pub mod reporter;

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::LimitResolver;
use crate::core::error::is_cancellation;
use crate::core::{cancel_pair, CancelToken, ExecutionResult, TestCase};
use crate::engine::{run_test, Checker, CompiledSolution, Executor, TestRun};

pub use matrix::{JobMatrix, MatrixTest};
pub use reporter::{render_table, restore_terminal, LogHold, Reporter, TableView};

/// One pending (solution, test) pair
#[derive(Debug, Clone)]
struct Job {
    solution: usize,
    test: usize,
    source_hash: String,
    test_hash: String,
    run: TestRun,
}

impl Job {
    fn key<'a>(&'a self, backend: &'a str) -> CacheKey<'a> {
        CacheKey {
            source_hash: &self.source_hash,
            test_hash: &self.test_hash,
            time_limit: self.run.time_limit_ms,
            memory_limit: self.run.memory_limit_kb,
            backend,
        }
    }
}

/// What a run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub matrix: JobMatrix,
    /// Jobs answered from the cache
    pub cached: usize,
    /// Jobs that went through the executor
    pub executed: usize,
    pub cancelled: bool,
}

pub struct Scheduler {
    executor: Arc<dyn Executor>,
    checker: Option<Arc<Checker>>,
    cache: CacheStore,
    package_root: PathBuf,
    cpus: usize,
    reporter: Option<Reporter>,
}

impl Scheduler {
    /// Scheduler using all available cores and no reporter
    pub fn new(executor: Arc<dyn Executor>, cache: CacheStore, package_root: impl Into<PathBuf>) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            executor,
            checker: None,
            cache,
            package_root: package_root.into(),
            cpus,
            reporter: None,
        }
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    pub fn with_checker(mut self, checker: Option<Checker>) -> Self {
        self.checker = checker.map(Arc::new);
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run `solutions` (in display order) on `tests`.
    ///
    /// Returns an error only for configuration problems found before
    /// dispatch. Cancellation is reported through `RunOutcome::cancelled`.
    pub async fn run(
        &self,
        solutions: &[CompiledSolution],
        tests: &[TestCase],
        limits: &LimitResolver,
        cancel: &CancelToken,
    ) -> Result<RunOutcome> {
        let mut columns = Vec::with_capacity(tests.len());
        let mut test_hashes = Vec::with_capacity(tests.len());
        for test in tests {
            columns.push(MatrixTest {
                name: test.name.clone(),
                group: test.group,
                time_limit_ms: limits.time_limit(test)?,
                memory_limit_kb: limits.memory_limit(test)?,
            });
            test_hashes.push(test.content_hash()?.to_string());
        }

        let backend = self.executor.name().to_string();
        let mut matrix = JobMatrix::new(solutions.iter().map(|s| s.name.clone()).collect(), columns);
        let mut entries: HashMap<String, CacheEntry> = HashMap::new();
        let mut jobs = Vec::new();
        let mut cached = 0;

        for (s, solution) in solutions.iter().enumerate() {
            let Some(executable) = &solution.executable else {
                info!("{} did not compile, marking all its tests as CE", solution.name);
                for t in 0..tests.len() {
                    matrix.set(s, t, ExecutionResult::compilation_error());
                }
                continue;
            };

            if !entries.contains_key(&solution.source_hash) {
                let entry = self.cache.entry(&solution.source_hash)?;
                entries.insert(solution.source_hash.clone(), entry);
            }
            let entry = &entries[&solution.source_hash];

            for (t, test) in tests.iter().enumerate() {
                let column = &matrix.tests[t];
                let job = Job {
                    solution: s,
                    test: t,
                    source_hash: solution.source_hash.clone(),
                    test_hash: test_hashes[t].clone(),
                    run: TestRun {
                        solution: solution.name.clone(),
                        executable: executable.clone(),
                        test: test.name.clone(),
                        input: test.path.clone(),
                        answer: test.answer_path(&self.package_root),
                        time_limit_ms: column.time_limit_ms,
                        memory_limit_kb: column.memory_limit_kb,
                    },
                };
                match entry.lookup(&job.key(&backend)) {
                    Some(result) => {
                        matrix.set(s, t, result.clone());
                        cached += 1;
                    }
                    None => jobs.push(job),
                }
            }
        }

        jobs.sort_by(|a, b| (a.solution, &tests[a.test]).cmp(&(b.solution, &tests[b.test])));
        info!(
            "{} jobs: {} cached, {} to run on {} workers",
            matrix.len(),
            cached,
            jobs.len(),
            self.cpus
        );

        let progress = Arc::new(AtomicUsize::new(matrix.completed()));
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(matrix.clone()));
        let (stop_reporter, reporter_stop) = cancel_pair();
        let reporter = self.reporter.clone().map(|r| {
            r.with_cpus(self.cpus)
                .spawn(snapshot_rx, Arc::clone(&progress), reporter_stop)
        });

        let workers = self.cpus.min(jobs.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(Job, Result<ExecutionResult>)>();
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let executor = Arc::clone(&self.executor);
            let checker = self.checker.clone();
            let executions_dir = self.cache.executions_dir();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!("Worker {} stopping, run cancelled", worker);
                        break;
                    }
                    let Some(job) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = run_test(
                        executor.as_ref(),
                        checker.as_deref(),
                        &job.run,
                        &executions_dir,
                        &cancel,
                    )
                    .await;
                    if tx.send((job, result)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut executed = 0;
        while let Some((job, result)) = rx.recv().await {
            let result = match result {
                Ok(result) => result,
                Err(e) if is_cancellation(&e) => {
                    debug!("{} on {} was cancelled", job.run.solution, job.run.test);
                    continue;
                }
                Err(e) => {
                    warn!("Job {} on {} failed: {:#}", job.run.solution, job.run.test, e);
                    ExecutionResult::runtime_error(format!("{:#}", e))
                }
            };

            if let Some(entry) = entries.get_mut(&job.source_hash) {
                entry.insert(&job.key(&backend), result.clone());
                if let Err(e) = self.cache.save(entry) {
                    warn!("Failed to save cached results of {}: {:#}", job.run.solution, e);
                }
            }
            matrix.set(job.solution, job.test, result);
            executed += 1;
            progress.fetch_add(1, Ordering::Relaxed);
            snapshot_tx.send_replace(Arc::new(matrix.clone()));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        stop_reporter.cancel();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                error!("Reporter task failed: {}", e);
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!(
                "Run cancelled with {}/{} jobs finished",
                matrix.completed(),
                matrix.len()
            );
        }

        Ok(RunOutcome {
            matrix,
            cached,
            executed,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::core::{CancelHandle, JudgeError, Status};
    use crate::engine::ExecuteRequest;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Echoes stdin to stdout and records the order of calls
    #[derive(Default)]
    struct EchoExecutor {
        calls: AtomicUsize,
        order: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, request: &ExecuteRequest, _cancel: &CancelToken) -> Result<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order
                .lock()
                .unwrap()
                .push(request.stdout.to_string_lossy().to_string());
            std::fs::copy(&request.stdin, &request.stdout)?;
            Ok(ExecutionResult::new(Status::Accepted).with_time(5).with_memory(512))
        }
    }

    /// Cancels the run on its second call
    struct InterruptingExecutor {
        handle: CancelHandle,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for InterruptingExecutor {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, request: &ExecuteRequest, _cancel: &CancelToken) -> Result<ExecutionResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                self.handle.cancel();
                return Err(JudgeError::Cancelled.into());
            }
            std::fs::copy(&request.stdin, &request.stdout)?;
            Ok(ExecutionResult::new(Status::Accepted).with_time(5).with_memory(512))
        }
    }

    fn package(root: &Path) -> Vec<TestCase> {
        std::fs::create_dir_all(root.join("in")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        let mut tests = Vec::new();
        for (name, content) in [("abc2a", "3\n"), ("abc1b", "2\n"), ("abc1a", "1\n")] {
            let input = root.join("in").join(format!("{}.in", name));
            std::fs::write(&input, content).unwrap();
            std::fs::write(root.join("out").join(format!("{}.out", name)), content).unwrap();
            tests.push(TestCase::from_path("abc", input).unwrap());
        }
        tests
    }

    fn solution(name: &str, hash: &str, compiled: bool) -> CompiledSolution {
        CompiledSolution {
            name: name.to_string(),
            source: PathBuf::from(format!("prog/{}", name)),
            source_hash: hash.to_string(),
            executable: compiled.then(|| PathBuf::from(format!("/nonexistent/{}.e", name))),
        }
    }

    fn limits() -> LimitResolver {
        let config = TaskConfig::parse("time_limit: 1000\nmemory_limit: 65536\n").unwrap();
        LimitResolver::new(&config, None, None)
    }

    #[tokio::test]
    async fn test_compilation_error_skips_executor() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let executor = Arc::new(EchoExecutor::default());
        let scheduler = Scheduler::new(executor.clone(), cache, dir.path()).with_cpus(2);

        let outcome = scheduler
            .run(&[solution("abc.cpp", "h1", false)], &tests, &limits(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.executed, 0);
        for t in 0..tests.len() {
            assert_eq!(outcome.matrix.get(0, t).status, Status::CompilationError);
        }
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let solutions = [solution("abc.cpp", "h1", true), solution("abcs1.cpp", "h2", true)];

        let first_executor = Arc::new(EchoExecutor::default());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let first = Scheduler::new(first_executor.clone(), cache.clone(), dir.path())
            .with_cpus(3)
            .run(&solutions, &tests, &limits(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(first_executor.calls.load(Ordering::SeqCst), 6);
        assert_eq!(first.matrix.completed(), 6);
        assert_eq!(first.matrix.get(1, 2).status, Status::Accepted);

        let second_executor = Arc::new(EchoExecutor::default());
        let second = Scheduler::new(second_executor.clone(), cache, dir.path())
            .with_cpus(3)
            .run(&solutions, &tests, &limits(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(second_executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.cached, 6);
        for s in 0..2 {
            for t in 0..3 {
                assert_eq!(second.matrix.get(s, t), first.matrix.get(s, t));
            }
        }
    }

    #[tokio::test]
    async fn test_jobs_are_dispatched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let executor = Arc::new(EchoExecutor::default());
        let solutions = [solution("abc.cpp", "h1", true), solution("abcb1.cpp", "h2", true)];

        Scheduler::new(executor.clone(), cache, dir.path())
            .with_cpus(1)
            .run(&solutions, &tests, &limits(), &CancelToken::never())
            .await
            .unwrap();

        let order: Vec<String> = executor
            .order
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                let path = Path::new(p);
                let solution = path.parent().unwrap().file_name().unwrap().to_string_lossy();
                format!("{}/{}", solution, path.file_stem().unwrap().to_string_lossy())
            })
            .collect();
        assert_eq!(
            order,
            vec![
                "abc.cpp/abc1a",
                "abc.cpp/abc1b",
                "abc.cpp/abc2a",
                "abcb1.cpp/abc1a",
                "abcb1.cpp/abc1b",
                "abcb1.cpp/abc2a",
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_keeps_only_completed_results() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let (handle, token) = cancel_pair();
        let executor = Arc::new(InterruptingExecutor {
            handle,
            calls: AtomicUsize::new(0),
        });

        let outcome = Scheduler::new(executor.clone(), cache.clone(), dir.path())
            .with_cpus(1)
            .run(&[solution("abc.cpp", "h1", true)], &tests, &limits(), &token)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.executed, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.matrix.completed(), 1);
        assert_eq!(cache.entry("h1").unwrap().tests.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_limits_fail_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let executor = Arc::new(EchoExecutor::default());
        let config = TaskConfig::parse("memory_limit: 65536\n").unwrap();

        let result = Scheduler::new(executor.clone(), cache, dir.path())
            .run(
                &[solution("abc.cpp", "h1", true)],
                &tests,
                &LimitResolver::new(&config, None, None),
                &CancelToken::never(),
            )
            .await;

        tokio_test::assert_err!(result);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reporter_runs_without_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let tests = package(dir.path());
        let cache = CacheStore::open(dir.path().join(".cache")).unwrap();
        let view = TableView::new(
            crate::scoring::ContestType::Default,
            std::collections::BTreeMap::from([(1, 50), (2, 50)]),
        );

        let outcome = Scheduler::new(Arc::new(EchoExecutor::default()), cache, dir.path())
            .with_reporter(Reporter::new(view).with_live(false))
            .run(&[solution("abc.cpp", "h1", true)], &tests, &limits(), &CancelToken::never())
            .await
            .unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.matrix.completed(), 3);
    }
}
