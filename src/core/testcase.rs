//! Test case model
//!
//! A test is identified by its input file `in/<task><id>.in`. The group is the
//! number embedded in the id (`abc3b` is group 3), and tests whose id ends with
//! `ocen` are example tests in group 0.

use anyhow::Result;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::error::JudgeError;
use super::utils::sha256_file;

pub type GroupId = u32;

/// Group reserved for example tests
pub const EXAMPLE_GROUP: GroupId = 0;

#[derive(Debug, Clone)]
pub struct TestCase {
    /// Path to the input file
    pub path: PathBuf,
    /// File stem, e.g. `abc1a`
    pub name: String,
    /// Test id without the task prefix, e.g. `1a`
    pub id: String,
    pub group: GroupId,
    /// Content hash of the input file, computed on first use
    hash: OnceLock<String>,
}

impl TestCase {
    /// Build a test case from its input path, stripping the task id prefix
    pub fn from_path(task_id: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| JudgeError::config(format!("Invalid test path {:?}", path)))?;

        let id = name.strip_prefix(task_id).unwrap_or(&name).to_string();
        let group = group_of(&id).ok_or_else(|| {
            JudgeError::config(format!("Cannot determine group of test {}", name))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            id,
            group,
            hash: OnceLock::new(),
        })
    }

    /// Ordinal of the test inside its group (`1a` -> `a`, `0ocen` -> `ocen`)
    pub fn ordinal(&self) -> &str {
        self.id.trim_start_matches(|c: char| c.is_ascii_digit())
    }

    /// Expected output path `<package>/out/<name>.out`
    pub fn answer_path(&self, package_root: &Path) -> PathBuf {
        package_root.join("out").join(format!("{}.out", self.name))
    }

    /// Hash of the input file contents. Computed once and reused.
    pub fn content_hash(&self) -> Result<&str> {
        if let Some(hash) = self.hash.get() {
            return Ok(hash);
        }
        let hash = sha256_file(&self.path)?;
        Ok(self.hash.get_or_init(|| hash))
    }

    /// Deterministic ordering: by group, then by test id
    pub fn sort_key(&self) -> (GroupId, &str) {
        (self.group, &self.id)
    }
}

impl PartialEq for TestCase {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for TestCase {}

impl PartialOrd for TestCase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TestCase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Group id of a test id: 0 for `ocen` tests, otherwise the digits it contains
pub fn group_of(test_id: &str) -> Option<GroupId> {
    if test_id.ends_with("ocen") {
        return Some(EXAMPLE_GROUP);
    }
    let digits: String = test_id.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
