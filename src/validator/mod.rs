//! Validator module for expected scores
//!
//! Compares the scores of a run with `sinol_expected_scores` from the task
//! config. The baseline is first cut down to the solutions and groups that were
//! actually run, so a partial run never reports the rest as removed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::core::{GroupId, JudgeError, Status, EXAMPLE_GROUP};
use crate::scoring::SolutionScore;

/// Expected outcome of one group: a bare status, or a status with points
/// for contests where a passed group can be worth less than its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupExpectation {
    Status(Status),
    Scored { status: Status, points: u64 },
}

impl GroupExpectation {
    pub fn status(&self) -> Status {
        match self {
            GroupExpectation::Status(status) => *status,
            GroupExpectation::Scored { status, .. } => *status,
        }
    }
}

impl fmt::Display for GroupExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupExpectation::Status(status) => write!(f, "{}", status.code()),
            GroupExpectation::Scored { status, points } => {
                write!(f, "{} ({} points)", status.code(), points)
            }
        }
    }
}

/// Baseline of one solution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedScore {
    pub expected: BTreeMap<GroupId, GroupExpectation>,
    pub points: u64,
}

pub type ExpectedScores = BTreeMap<String, ExpectedScore>;

/// Which part of the package a run covered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunScope {
    /// No `--solutions` filter was given
    pub all_solutions: bool,
    /// No `--tests` filter was given
    pub all_tests: bool,
}

impl RunScope {
    pub fn full() -> Self {
        Self {
            all_solutions: true,
            all_tests: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    pub solution: String,
    pub group: GroupId,
    pub old: GroupExpectation,
    pub new: GroupExpectation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsChange {
    pub solution: String,
    pub old: u64,
    pub new: u64,
}

/// Differences between the (filtered) baseline and the new scores
#[derive(Debug, Clone, Default)]
pub struct ScoreDiff {
    pub added_solutions: BTreeSet<String>,
    pub removed_solutions: BTreeSet<String>,
    pub added_groups: BTreeSet<GroupId>,
    pub removed_groups: BTreeSet<GroupId>,
    pub changes: Vec<GroupChange>,
    pub points_changes: Vec<PointsChange>,
    /// The two sides differ in a way none of the lists above describes
    pub unrecognized_change: bool,
    /// Baseline restricted to what was run
    pub expected: ExpectedScores,
    /// Expectations derived from the run
    pub new: ExpectedScores,
}

impl ScoreDiff {
    pub fn is_correct(&self) -> bool {
        self.expected == self.new
    }

    /// Human readable description of every difference
    pub fn messages(&self) -> Vec<String> {
        let mut messages = Vec::new();
        let mut list = |items: Vec<String>, label: &str| {
            if !items.is_empty() {
                messages.push(format!("{}: {}", label, items.join(", ")));
            }
        };
        list(self.added_solutions.iter().cloned().collect(), "Solutions were added");
        list(self.removed_solutions.iter().cloned().collect(), "Solutions were removed");
        list(self.added_groups.iter().map(|g| g.to_string()).collect(), "Groups were added");
        list(self.removed_groups.iter().map(|g| g.to_string()).collect(), "Groups were removed");

        for change in &self.changes {
            messages.push(format!(
                "Solution {} passed group {} with status {} while it should pass with status {}.",
                change.solution, change.group, change.new, change.old
            ));
        }
        for change in &self.points_changes {
            messages.push(format!(
                "Solution {} scored {} points while it should score {} points.",
                change.solution, change.new, change.old
            ));
        }
        if self.unrecognized_change {
            messages.push("Expected scores changed in a way that could not be described.".to_string());
        }
        messages
    }
}

/// Compares and updates expected scores using the configured group weights
#[derive(Debug, Clone)]
pub struct Validator<'a> {
    weights: &'a BTreeMap<GroupId, u64>,
}

impl<'a> Validator<'a> {
    pub fn new(weights: &'a BTreeMap<GroupId, u64>) -> Self {
        Self { weights }
    }

    /// Sum of the weights of passed groups. Group 0 never counts, and any
    /// other group without a weight is a configuration error.
    pub fn calculate_points(&self, groups: &BTreeMap<GroupId, GroupExpectation>) -> Result<u64, JudgeError> {
        let mut points = 0;
        for (&group, expectation) in groups {
            if group == EXAMPLE_GROUP {
                continue;
            }
            let weight = self.weights.get(&group).copied().ok_or_else(|| {
                JudgeError::config(format!(
                    "Group {} doesn't have points specified in config file.",
                    group
                ))
            })?;
            points += match expectation {
                GroupExpectation::Status(Status::Accepted) => weight,
                GroupExpectation::Status(_) => 0,
                GroupExpectation::Scored { points, .. } => *points,
            };
        }
        Ok(points)
    }

    /// Every scored group of the package and of the baseline must have a weight.
    /// Checked before any job runs.
    pub fn check_weights(&self, groups: &[GroupId], baseline: &ExpectedScores) -> Result<(), JudgeError> {
        let expected_groups = baseline.values().flat_map(|score| score.expected.keys());
        for &group in groups.iter().chain(expected_groups) {
            if group != EXAMPLE_GROUP && !self.weights.contains_key(&group) {
                return Err(JudgeError::config(format!(
                    "Group {} doesn't have points specified in config file.",
                    group
                )));
            }
        }
        Ok(())
    }

    /// Expectations describing the scores of a run
    pub fn expectations(&self, scores: &BTreeMap<String, SolutionScore>) -> Result<ExpectedScores> {
        let mut expected = ExpectedScores::new();
        for (solution, score) in scores {
            let mut groups = BTreeMap::new();
            for (&group, result) in &score.groups {
                let weight = self.weights.get(&group).copied().unwrap_or(0);
                let implied = if result.status.is_ok() { weight } else { 0 };
                let expectation = if group == EXAMPLE_GROUP || result.points == implied {
                    GroupExpectation::Status(result.status)
                } else {
                    GroupExpectation::Scored {
                        status: result.status,
                        points: result.points,
                    }
                };
                groups.insert(group, expectation);
            }
            let points = self.calculate_points(&groups)?;
            expected.insert(
                solution.clone(),
                ExpectedScore {
                    expected: groups,
                    points,
                },
            );
        }
        Ok(expected)
    }

    /// Diff `new` against `baseline`, limited to what `scope` says was run
    pub fn validate(&self, baseline: &ExpectedScores, new: ExpectedScores, scope: RunScope) -> Result<ScoreDiff> {
        let check_solutions = scope.all_solutions && !baseline.is_empty();
        let check_groups = scope.all_tests && !baseline.is_empty();

        let used_solutions: BTreeSet<&String> = if check_solutions {
            baseline.keys().collect()
        } else {
            new.keys().collect()
        };
        let used_groups: BTreeSet<GroupId> = if check_groups {
            baseline.values().flat_map(|s| s.expected.keys().copied()).collect()
        } else {
            new.values().flat_map(|s| s.expected.keys().copied()).collect()
        };

        let mut expected = ExpectedScores::new();
        for solution in used_solutions {
            let Some(score) = baseline.get(solution) else {
                continue;
            };
            let groups: BTreeMap<GroupId, GroupExpectation> = score
                .expected
                .iter()
                .filter(|(group, _)| used_groups.contains(group))
                .map(|(&group, &expectation)| (group, expectation))
                .collect();
            let points = self
                .calculate_points(&groups)
                .with_context(|| format!("Invalid expected scores of {}", solution))?;
            expected.insert(
                solution.clone(),
                ExpectedScore {
                    expected: groups,
                    points,
                },
            );
        }

        let mut diff = ScoreDiff::default();
        for (solution, new_score) in &new {
            let Some(old_score) = expected.get(solution) else {
                diff.added_solutions.insert(solution.clone());
                continue;
            };

            for (&group, &new_result) in &new_score.expected {
                match old_score.expected.get(&group) {
                    None => {
                        diff.added_groups.insert(group);
                    }
                    Some(&old_result) if old_result != new_result => diff.changes.push(GroupChange {
                        solution: solution.clone(),
                        group,
                        old: old_result,
                        new: new_result,
                    }),
                    Some(_) => {}
                }
            }
            for &group in old_score.expected.keys() {
                if !new_score.expected.contains_key(&group) && check_groups {
                    diff.removed_groups.insert(group);
                }
            }
            if old_score.points != new_score.points {
                diff.points_changes.push(PointsChange {
                    solution: solution.clone(),
                    old: old_score.points,
                    new: new_score.points,
                });
            }
        }
        for solution in expected.keys() {
            if !new.contains_key(solution) && check_solutions {
                diff.removed_solutions.insert(solution.clone());
            }
        }

        let described = !diff.added_solutions.is_empty()
            || !diff.removed_solutions.is_empty()
            || !diff.added_groups.is_empty()
            || !diff.removed_groups.is_empty()
            || !diff.changes.is_empty()
            || !diff.points_changes.is_empty();
        diff.unrecognized_change = expected != new && !described;
        debug!(
            "Expected scores diff: {} changes, unrecognized: {}",
            diff.changes.len(),
            diff.unrecognized_change
        );

        diff.expected = expected;
        diff.new = new;
        Ok(diff)
    }

    /// Rewrite the baseline so it matches the run described by `diff`
    pub fn apply(&self, diff: &ScoreDiff, baseline: &mut ExpectedScores) -> Result<(), JudgeError> {
        for solution in &diff.removed_solutions {
            baseline.remove(solution);
        }

        for score in baseline.values_mut() {
            let before = score.expected.len();
            score.expected.retain(|group, _| !diff.removed_groups.contains(group));
            if score.expected.len() != before {
                score.points = self.calculate_points(&score.expected)?;
            }
        }

        for (solution, new_score) in &diff.new {
            match baseline.get_mut(solution) {
                Some(score) => {
                    score.expected.extend(new_score.expected.iter().map(|(&g, &e)| (g, e)));
                    score.points = self.calculate_points(&score.expected)?;
                }
                None => {
                    baseline.insert(solution.clone(), new_score.clone());
                }
            }
        }
        Ok(())
    }
}

/// YAML dump under a `sinol_expected_scores` key, as printed before the diff
pub fn dump_expected_scores(scores: &ExpectedScores) -> Result<String> {
    let document = BTreeMap::from([("sinol_expected_scores", scores)]);
    serde_yaml::to_string(&document).context("Failed to serialize expected scores")
}
