//! Task configuration (`config.yml`)
//!
//! Only the keys the engine understands are typed; everything else is kept in
//! `extra` so rewriting the expected scores does not lose unrelated settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::core::{GroupId, JudgeError, TestCase};
use crate::scoring::ContestType;
use crate::validator::ExpectedScore;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sinol_task_id: Option<String>,
    /// Time limit in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    /// Memory limit in KB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    /// Per-group time limit overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub time_limits: BTreeMap<GroupId, u64>,
    /// Per-group memory limit overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub memory_limits: BTreeMap<GroupId, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<BTreeMap<GroupId, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_score: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sinol_contest_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sinol_expected_scores: BTreeMap<String, ExpectedScore>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TaskConfig {
    /// Read and validate `config.yml`. Parse errors are configuration errors.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::parse(&content)?;
        config.contest_type()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, JudgeError> {
        serde_yaml::from_str(content)
            .map_err(|e| JudgeError::config(format!("Malformed {}: {}", CONFIG_FILE, e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn contest_type(&self) -> Result<ContestType, JudgeError> {
        match &self.sinol_contest_type {
            Some(name) => name.parse(),
            None => Ok(ContestType::Default),
        }
    }

    /// Group weights from `scores`, or the contest's defaults when they are missing
    pub fn weights(&self, contest: ContestType, groups: &[GroupId]) -> BTreeMap<GroupId, u64> {
        match &self.scores {
            Some(scores) if contest != ContestType::Icpc => {
                let mut weights = scores.clone();
                weights.entry(crate::core::EXAMPLE_GROUP).or_insert(0);
                let total: u64 = scores.values().sum();
                let expected = self.total_score.unwrap_or(100);
                if total != expected {
                    warn!("Scores sum up to {} (instead of {})", total, expected);
                }
                weights
            }
            _ => contest.assign_default_weights(groups),
        }
    }
}

/// Resolves the limits of each test from CLI overrides and the config
#[derive(Debug, Clone)]
pub struct LimitResolver {
    time_limit: Option<u64>,
    memory_limit: Option<u64>,
    time_limits: BTreeMap<GroupId, u64>,
    memory_limits: BTreeMap<GroupId, u64>,
    time_override: Option<u64>,
    memory_override: Option<u64>,
}

impl LimitResolver {
    /// `time_override_ms`/`memory_override_kb` win over everything in the config
    pub fn new(config: &TaskConfig, time_override_ms: Option<u64>, memory_override_kb: Option<u64>) -> Self {
        if let (Some(over), Some(conf)) = (time_override_ms, config.time_limit) {
            if over != conf {
                warn!("Time limit was overridden to {}ms (config says {}ms)", over, conf);
            }
        }
        if let (Some(over), Some(conf)) = (memory_override_kb, config.memory_limit) {
            if over != conf {
                warn!("Memory limit was overridden to {}KB (config says {}KB)", over, conf);
            }
        }

        Self {
            time_limit: config.time_limit,
            memory_limit: config.memory_limit,
            time_limits: config.time_limits.clone(),
            memory_limits: config.memory_limits.clone(),
            time_override: time_override_ms,
            memory_override: memory_override_kb,
        }
    }

    /// Time limit of a test in milliseconds
    pub fn time_limit(&self, test: &TestCase) -> Result<u64, JudgeError> {
        self.time_override
            .or_else(|| self.time_limits.get(&test.group).copied())
            .or(self.time_limit)
            .ok_or_else(|| {
                JudgeError::config(format!("Time limit was not defined for test {}", test.name))
            })
    }

    /// Memory limit of a test in KB
    pub fn memory_limit(&self, test: &TestCase) -> Result<u64, JudgeError> {
        self.memory_override
            .or_else(|| self.memory_limits.get(&test.group).copied())
            .or(self.memory_limit)
            .ok_or_else(|| {
                JudgeError::config(format!("Memory limit was not defined for test {}", test.name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Status;
    use crate::validator::GroupExpectation;

    const CONFIG: &str = r#"
title: Example task
sinol_task_id: abc
time_limit: 1000
memory_limit: 65536
time_limits:
  3: 2000
scores:
  1: 40
  2: 60
sinol_contest_type: oi
sinol_expected_scores:
  abc.cpp:
    expected:
      1: OK
      2: {status: WA, points: 0}
    points: 40
sinol_latex_compiler: pdflatex
"#;

    #[test]
    fn test_parse_config() {
        let config = TaskConfig::parse(CONFIG).unwrap();
        assert_eq!(config.time_limit, Some(1000));
        assert_eq!(config.contest_type().unwrap(), ContestType::Oi);
        let expected = &config.sinol_expected_scores["abc.cpp"];
        assert_eq!(expected.points, 40);
        assert_eq!(expected.expected[&1], GroupExpectation::Status(Status::Accepted));
        assert_eq!(
            expected.expected[&2],
            GroupExpectation::Scored {
                status: Status::WrongAnswer,
                points: 0
            }
        );
        assert!(config.extra.contains_key("sinol_latex_compiler"));
    }

    #[test]
    fn test_save_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = TaskConfig::parse(CONFIG).unwrap();
        config.save(&path).unwrap();

        let reloaded = TaskConfig::load(&path).unwrap();
        assert_eq!(reloaded.extra.get("sinol_latex_compiler"), config.extra.get("sinol_latex_compiler"));
        assert_eq!(reloaded.sinol_expected_scores, config.sinol_expected_scores);
        assert_eq!(reloaded.scores, config.scores);
    }

    #[test]
    fn test_malformed_config_is_configuration_error() {
        assert!(matches!(
            TaskConfig::parse("time_limit: [1, 2"),
            Err(JudgeError::Config(_))
        ));
        let unknown = TaskConfig::parse("sinol_contest_type: ioi\n").unwrap();
        assert!(unknown.contest_type().is_err());
    }

    #[test]
    fn test_limit_resolution_order() {
        let config = TaskConfig::parse(CONFIG).unwrap();
        let plain = TestCase::from_path("abc", "in/abc1a.in").unwrap();
        let slow = TestCase::from_path("abc", "in/abc3a.in").unwrap();

        let resolver = LimitResolver::new(&config, None, None);
        assert_eq!(resolver.time_limit(&plain).unwrap(), 1000);
        assert_eq!(resolver.time_limit(&slow).unwrap(), 2000);
        assert_eq!(resolver.memory_limit(&slow).unwrap(), 65536);

        let overridden = LimitResolver::new(&config, Some(500), Some(1024));
        assert_eq!(overridden.time_limit(&slow).unwrap(), 500);
        assert_eq!(overridden.memory_limit(&plain).unwrap(), 1024);
    }

    #[test]
    fn test_missing_limit_is_configuration_error() {
        let config = TaskConfig::parse("title: x\n").unwrap();
        let test = TestCase::from_path("abc", "in/abc1a.in").unwrap();
        let resolver = LimitResolver::new(&config, None, None);
        assert!(matches!(resolver.time_limit(&test), Err(JudgeError::Config(_))));
    }

    #[test]
    fn test_weights_fall_back_to_defaults() {
        let config = TaskConfig::parse("title: x\n").unwrap();
        let weights = config.weights(ContestType::Default, &[0, 1, 2]);
        assert_eq!(weights, BTreeMap::from([(0, 0), (1, 50), (2, 50)]));

        let configured = TaskConfig::parse(CONFIG).unwrap();
        let weights = configured.weights(ContestType::Default, &[1, 2]);
        assert_eq!(weights, BTreeMap::from([(0, 0), (1, 40), (2, 60)]));
    }
}
