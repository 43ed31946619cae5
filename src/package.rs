//! Package layout
//!
//! ```text
//! <task>/
//!   config.yml
//!   in/<task><test>.in   out/<task><test>.out
//!   prog/<task>.cpp      main solution
//!   prog/<task>s1.cpp    slow solution
//!   prog/<task>b1.cpp    bad solution
//!   prog/<task>chk.cpp   optional checker
//!   .cache/
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{TaskConfig, CONFIG_FILE};
use crate::core::{JudgeError, TestCase};

pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "cc", "py"];
const HEADER_EXTENSIONS: &[&str] = &["h", "hpp"];
const CACHE_DIR: &str = ".cache";

/// Kind of a solution, by the letter after the task id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SolutionKind {
    Main,
    Slow,
    Bad,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub root: PathBuf,
    pub task_id: String,
}

impl Package {
    /// Task id comes from `sinol_task_id`, falling back to the directory name
    pub fn new(root: impl Into<PathBuf>, config: &TaskConfig) -> Result<Self> {
        let root = root.into();
        let task_id = match &config.sinol_task_id {
            Some(id) => id.clone(),
            None => root
                .canonicalize()
                .with_context(|| format!("Failed to resolve package directory {:?}", root))?
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Package directory has no name")?,
        };
        debug!("Package {:?} has task id {}", root, task_id);
        Ok(Self { root, task_id })
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn prog_dir(&self) -> PathBuf {
        self.root.join("prog")
    }

    /// Tests in `in/`, sorted by group then id. `filter` keeps only the named
    /// tests (by path, file name or stem); naming a missing test is an error.
    pub fn tests(&self, filter: Option<&[String]>) -> Result<Vec<TestCase>> {
        let dir = self.root.join("in");
        let mut tests = Vec::new();
        for path in list_files(&dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&self.task_id) || !name.ends_with(".in") {
                continue;
            }
            tests.push(TestCase::from_path(&self.task_id, &path)?);
        }

        if let Some(filter) = filter {
            let wanted = filter
                .iter()
                .map(|item| file_stem(item))
                .collect::<Vec<_>>();
            for stem in &wanted {
                if !tests.iter().any(|t| &t.name == stem) {
                    return Err(JudgeError::config(format!("Test {} does not exist", stem)).into());
                }
            }
            tests.retain(|t| wanted.contains(&t.name));
        }

        tests.sort();
        Ok(tests)
    }

    /// Solution sources in `prog/`, main first, then slow, then bad
    pub fn solutions(&self, filter: Option<&[String]>) -> Result<Vec<PathBuf>> {
        let mut solutions: Vec<PathBuf> = list_files(&self.prog_dir())?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| parse_solution(&self.task_id, n))
                    .is_some()
            })
            .collect();

        if let Some(filter) = filter {
            let wanted: Vec<String> = filter.iter().map(|item| file_name(item)).collect();
            for name in &wanted {
                if !solutions.iter().any(|p| file_name_of(p) == *name) {
                    return Err(JudgeError::config(format!("Solution {} does not exist", name)).into());
                }
            }
            solutions.retain(|p| wanted.contains(&file_name_of(p)));
        }

        solutions.sort_by_key(|path| {
            let name = file_name_of(path);
            let key = parse_solution(&self.task_id, &name);
            (key, name)
        });
        Ok(solutions)
    }

    /// `prog/<task>chk.<ext>` if the package has one
    pub fn checker_source(&self) -> Option<PathBuf> {
        SOURCE_EXTENSIONS
            .iter()
            .map(|ext| self.prog_dir().join(format!("{}chk.{}", self.task_id, ext)))
            .find(|path| path.exists())
    }

    /// Headers in `prog/` that solutions may include
    pub fn library_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = list_files(&self.prog_dir())?
            .into_iter()
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| HEADER_EXTENSIONS.contains(&e))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Parse `<id>[bs]?[0-9]*(_suffix)?.(c|cpp|cc|py)` into (kind, number)
pub fn parse_solution(task_id: &str, file_name: &str) -> Option<(SolutionKind, u64)> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !SOURCE_EXTENSIONS.contains(&extension) {
        return None;
    }
    let rest = stem.strip_prefix(task_id)?;
    let rest = match rest.split_once('_') {
        Some((_, "")) => return None,
        Some((head, _)) => head,
        None => rest,
    };
    let (kind, digits) = match rest.strip_prefix('s') {
        Some(digits) => (SolutionKind::Slow, digits),
        None => match rest.strip_prefix('b') {
            Some(digits) => (SolutionKind::Bad, digits),
            None => (SolutionKind::Main, rest),
        },
    };
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    Some((kind, number))
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_name(item: &str) -> String {
    file_name_of(Path::new(item))
}

fn file_stem(item: &str) -> String {
    let name = file_name(item);
    name.strip_suffix(".in").map(str::to_string).unwrap_or(name)
}
