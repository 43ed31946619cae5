//! Result cache
//!
//! One JSON file per compiled artifact, named after the SHA-256 of its source:
//!
//! ```text
//! .cache/
//!   results/<source-hash>.json   source name, executable, per-test results
//!   markers/contest_type         contest type the results were scored for
//!   markers/checker              hash of the checker ("none" without one)
//!   executables/  compilation/  executions/
//! ```
//!
//! A cached result is reused only when the test hash, both limits and the
//! backend name all match the request.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::ExecutionResult;

const RESULTS_DIR: &str = "results";
const MARKERS_DIR: &str = "markers";
const EXECUTABLES_DIR: &str = "executables";
const COMPILATION_DIR: &str = "compilation";
const EXECUTIONS_DIR: &str = "executions";

const CONTEST_TYPE_MARKER: &str = "contest_type";
const CHECKER_MARKER: &str = "checker";
const NO_CHECKER: &str = "none";

/// A result together with the conditions it was produced under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub time_limit: u64,
    pub memory_limit: u64,
    pub backend: String,
    pub result: ExecutionResult,
}

/// Everything that must match for a cache hit
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub source_hash: &'a str,
    pub test_hash: &'a str,
    pub time_limit: u64,
    pub memory_limit: u64,
    pub backend: &'a str,
}

/// Contents of one per-artifact cache file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_hash: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
    /// Hash of extra files (libraries) the artifact was built with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_hash: Option<String>,
    /// Test content hash -> result
    #[serde(default)]
    pub tests: BTreeMap<String, CachedResult>,
}

impl CacheEntry {
    pub fn new(source_hash: impl Into<String>) -> Self {
        Self {
            source_hash: source_hash.into(),
            ..Default::default()
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<&ExecutionResult> {
        self.tests
            .get(key.test_hash)
            .filter(|cached| {
                cached.time_limit == key.time_limit
                    && cached.memory_limit == key.memory_limit
                    && cached.backend == key.backend
            })
            .map(|cached| &cached.result)
    }

    /// Record a finished result, replacing whatever was stored for that test
    pub fn insert(&mut self, key: &CacheKey, result: ExecutionResult) {
        if result.status.is_pending() {
            warn!("Refusing to cache a pending result for test {}", key.test_hash);
            return;
        }
        self.tests.insert(
            key.test_hash.to_string(),
            CachedResult {
                time_limit: key.time_limit,
                memory_limit: key.memory_limit,
                backend: key.backend.to_string(),
                result,
            },
        );
    }
}

/// On-disk cache rooted at a package's `.cache` directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) the cache directory tree
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [
            RESULTS_DIR,
            MARKERS_DIR,
            EXECUTABLES_DIR,
            COMPILATION_DIR,
            EXECUTIONS_DIR,
        ] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create cache directory {:?}", root.join(dir)))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executables_dir(&self) -> PathBuf {
        self.root.join(EXECUTABLES_DIR)
    }

    pub fn compilation_dir(&self) -> PathBuf {
        self.root.join(COMPILATION_DIR)
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.root.join(EXECUTIONS_DIR)
    }

    fn entry_path(&self, source_hash: &str) -> PathBuf {
        self.root.join(RESULTS_DIR).join(format!("{}.json", source_hash))
    }

    /// Load the entry for an artifact. A missing or unreadable file yields an empty entry.
    pub fn entry(&self, source_hash: &str) -> Result<CacheEntry> {
        let path = self.entry_path(source_hash);
        if !path.exists() {
            return Ok(CacheEntry::new(source_hash));
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) if entry.source_hash == source_hash => Ok(entry),
            Ok(_) => {
                warn!("Cache file {:?} belongs to another source, ignoring it", path);
                Ok(CacheEntry::new(source_hash))
            }
            Err(e) => {
                warn!("Corrupted cache file {:?}: {}", path, e);
                Ok(CacheEntry::new(source_hash))
            }
        }
    }

    /// Write an entry atomically
    pub fn save(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.source_hash);
        let dir = self.root.join(RESULTS_DIR);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
        let data = serde_json::to_vec_pretty(entry).context("Failed to serialize cache entry")?;
        tmp.write_all(&data)?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write cache file {:?}", path))?;
        Ok(())
    }

    pub fn lookup(&self, key: &CacheKey) -> Result<Option<ExecutionResult>> {
        Ok(self.entry(key.source_hash)?.lookup(key).cloned())
    }

    pub fn store(&self, key: &CacheKey, result: &ExecutionResult) -> Result<()> {
        let mut entry = self.entry(key.source_hash)?;
        entry.insert(key, result.clone());
        self.save(&entry)
    }

    /// Executable recorded for a source hash, if it still exists on disk
    pub fn compiled_executable(&self, source_hash: &str) -> Result<Option<PathBuf>> {
        let entry = self.entry(source_hash)?;
        Ok(entry.executable_path.filter(|path| path.exists()))
    }

    /// Remember where a source was compiled to. Entries left behind by earlier
    /// versions of the same source file are dropped.
    pub fn record_executable(&self, source_name: &str, source_hash: &str, executable: &Path) -> Result<()> {
        for stale in self.entries()? {
            if stale.source_name == source_name && stale.source_hash != source_hash {
                info!("Source {} changed, dropping its cached results", source_name);
                self.remove(&stale.source_hash)?;
            }
        }

        let mut entry = self.entry(source_hash)?;
        entry.source_name = source_name.to_string();
        entry.executable_path = Some(executable.to_path_buf());
        self.save(&entry)
    }

    /// Wipe an artifact's results and executable when the files it depends on changed
    pub fn check_dependencies(&self, source_hash: &str, dependency_hash: &str) -> Result<()> {
        let mut entry = self.entry(source_hash)?;
        if entry.dependency_hash.as_deref() == Some(dependency_hash) {
            return Ok(());
        }
        entry.executable_path = None;
        if entry.dependency_hash.is_some() && !entry.tests.is_empty() {
            info!(
                "Dependencies of {} changed, dropping its cached results",
                entry.source_name
            );
        }
        entry.tests.clear();
        entry.dependency_hash = Some(dependency_hash.to_string());
        self.save(&entry)
    }

    pub fn remove(&self, source_hash: &str) -> Result<()> {
        let path = self.entry_path(source_hash);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }

    /// All readable cache entries
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = self.root.join(RESULTS_DIR);
        let mut entries = Vec::new();
        for file in std::fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            entries.push(self.entry(hash)?);
        }
        Ok(entries)
    }

    /// Drop every cached result while keeping compiled executables
    pub fn wipe_results(&self) -> Result<()> {
        for mut entry in self.entries()? {
            if entry.tests.is_empty() {
                continue;
            }
            entry.tests.clear();
            self.save(&entry)?;
        }
        Ok(())
    }

    /// Compare the contest type and checker with the ones the cache was built for.
    /// Any difference wipes all results. Returns whether a wipe happened.
    pub fn sync_markers(&self, contest_type: &str, checker_hash: Option<&str>) -> Result<bool> {
        let checker = checker_hash.unwrap_or(NO_CHECKER);
        let mut changed = false;

        for (marker, value) in [(CONTEST_TYPE_MARKER, contest_type), (CHECKER_MARKER, checker)] {
            let path = self.root.join(MARKERS_DIR).join(marker);
            let previous = std::fs::read_to_string(&path).ok();
            match previous.as_deref().map(str::trim) {
                Some(previous) if previous == value => {}
                Some(previous) => {
                    info!("{} changed from {} to {}, clearing cached results", marker, previous, value);
                    changed = true;
                }
                // A fresh cache has nothing to invalidate
                None => debug!("Recording {} marker {}", marker, value),
            }
            std::fs::write(&path, value).with_context(|| format!("Failed to write {:?}", path))?;
        }

        if changed {
            self.wipe_results()?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Status;

    fn key<'a>(test_hash: &'a str) -> CacheKey<'a> {
        CacheKey {
            source_hash: "src1",
            test_hash,
            time_limit: 1000,
            memory_limit: 65536,
            backend: "time",
        }
    }

    fn ok_result() -> ExecutionResult {
        ExecutionResult::new(Status::Accepted)
            .with_time(120)
            .with_memory(2048)
            .with_points(100.0)
    }

    fn open_store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join(".cache")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_lookup_after_store_returns_result() {
        let (_dir, store) = open_store();
        store.store(&key("t1"), &ok_result()).unwrap();
        assert_eq!(store.lookup(&key("t1")).unwrap(), Some(ok_result()));
    }

    #[test]
    fn test_any_key_change_misses() {
        let (_dir, store) = open_store();
        store.store(&key("t1"), &ok_result()).unwrap();

        let variants = [
            CacheKey { source_hash: "src2", ..key("t1") },
            CacheKey { test_hash: "t2", ..key("t1") },
            CacheKey { time_limit: 2000, ..key("t1") },
            CacheKey { memory_limit: 1024, ..key("t1") },
            CacheKey { backend: "sio2jail", ..key("t1") },
        ];
        for variant in variants {
            assert_eq!(store.lookup(&variant).unwrap(), None, "{:?}", variant);
        }
    }

    #[test]
    fn test_pending_results_are_not_cached() {
        let mut entry = CacheEntry::new("src1");
        entry.insert(&key("t1"), ExecutionResult::pending());
        assert!(entry.tests.is_empty());
    }

    #[test]
    fn test_contest_type_change_wipes_results() {
        let (_dir, store) = open_store();
        assert!(!store.sync_markers("default", None).unwrap());
        store.store(&key("t1"), &ok_result()).unwrap();

        assert!(!store.sync_markers("default", None).unwrap());
        assert!(store.lookup(&key("t1")).unwrap().is_some());

        assert!(store.sync_markers("icpc", None).unwrap());
        assert!(store.lookup(&key("t1")).unwrap().is_none());
    }

    #[test]
    fn test_checker_change_wipes_results() {
        let (_dir, store) = open_store();
        store.sync_markers("default", Some("chk1")).unwrap();
        store.store(&key("t1"), &ok_result()).unwrap();
        assert!(store.sync_markers("default", Some("chk2")).unwrap());
        assert!(store.lookup(&key("t1")).unwrap().is_none());
    }

    #[test]
    fn test_dependency_change_wipes_artifact() {
        let (_dir, store) = open_store();
        store.check_dependencies("src1", "lib1").unwrap();
        store.store(&key("t1"), &ok_result()).unwrap();

        store.check_dependencies("src1", "lib1").unwrap();
        assert!(store.lookup(&key("t1")).unwrap().is_some());

        store.check_dependencies("src1", "lib2").unwrap();
        assert!(store.lookup(&key("t1")).unwrap().is_none());
    }

    #[test]
    fn test_source_change_drops_old_entry() {
        let (dir, store) = open_store();
        let exe = dir.path().join("abc.e");
        std::fs::write(&exe, "").unwrap();

        store.record_executable("abc.cpp", "src1", &exe).unwrap();
        store.store(&key("t1"), &ok_result()).unwrap();
        assert_eq!(store.compiled_executable("src1").unwrap(), Some(exe.clone()));

        store.record_executable("abc.cpp", "src9", &exe).unwrap();
        assert!(store.lookup(&key("t1")).unwrap().is_none());
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let (dir, store) = open_store();
        store.store(&key("t1"), &ok_result()).unwrap();

        let reopened = CacheStore::open(dir.path().join(".cache")).unwrap();
        assert_eq!(reopened.lookup(&key("t1")).unwrap(), Some(ok_result()));
    }
}
