//! Contest scoring strategies
//!
//! Turns per-test results into group scores and a global score. The set of
//! contest types is closed and chosen by `sinol_contest_type` in the task config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::core::{ExecutionResult, GroupId, JudgeError, Status, EXAMPLE_GROUP};

/// Score obtained by one solution in one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupScore {
    pub status: Status,
    pub points: u64,
}

/// Group scores and total of one solution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionScore {
    pub groups: BTreeMap<GroupId, GroupScore>,
    pub points: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContestType {
    /// Group score scales with the worst test; global score is the sum
    #[default]
    Default,
    /// Polish Olympiad: points decay once a test takes more than half the limit
    Oi,
    /// Junior Olympiad: default scoring, explicit scores must sum to the total
    Oij,
    /// Binary per test, group and task
    Icpc,
    /// Like `Oi`, but a fast run keeps the checker's points
    Talent,
}

impl ContestType {
    pub fn name(self) -> &'static str {
        match self {
            ContestType::Default => "default",
            ContestType::Oi => "oi",
            ContestType::Oij => "oij",
            ContestType::Icpc => "icpc",
            ContestType::Talent => "talent",
        }
    }

    /// Score of a single test, before group weighting
    pub fn test_score(self, result: &ExecutionResult, time_limit_ms: u64, _memory_limit_kb: u64) -> f64 {
        match self {
            ContestType::Default | ContestType::Oij => {
                if result.status.is_ok() {
                    result.points
                } else {
                    0.0
                }
            }
            ContestType::Icpc => {
                if result.status.is_ok() {
                    1.0
                } else {
                    0.0
                }
            }
            ContestType::Oi => time_decay(result, time_limit_ms, 100.0),
            ContestType::Talent => time_decay(result, time_limit_ms, result.points),
        }
    }

    /// Combine test scores of one group into the group's points
    pub fn group_score(self, test_scores: &[f64], group_max: u64) -> u64 {
        let Some(min) = test_scores.iter().copied().reduce(f64::min) else {
            return 0;
        };
        match self {
            ContestType::Icpc => min.max(0.0) as u64,
            _ => ((group_max as f64 * min) / 100.0).floor().max(0.0) as u64,
        }
    }

    /// Combine group scores into the solution's total
    pub fn global_score(self, groups: &BTreeMap<GroupId, GroupScore>, _global_max: u64) -> u64 {
        match self {
            ContestType::Icpc => groups.values().map(|g| g.points).min().unwrap_or(0),
            _ => groups.values().map(|g| g.points).sum(),
        }
    }

    /// Weights used when the config does not list `scores`.
    /// Group 0 gets nothing; 100 points are split evenly, remainder to the last group.
    pub fn assign_default_weights(self, groups: &[GroupId]) -> BTreeMap<GroupId, u64> {
        if self == ContestType::Icpc {
            return groups.iter().map(|&g| (g, 1)).collect();
        }

        warn!("Scores are not defined in config.yml. Points will be assigned equally to all groups.");
        let mut scored: Vec<GroupId> = groups
            .iter()
            .copied()
            .filter(|&g| g != EXAMPLE_GROUP)
            .collect();
        scored.sort_unstable();
        scored.dedup();

        let mut weights = BTreeMap::new();
        if groups.contains(&EXAMPLE_GROUP) {
            weights.insert(EXAMPLE_GROUP, 0);
        }
        let Some(&last) = scored.last() else {
            return weights;
        };
        let share = 100 / scored.len() as u64;
        for &group in &scored {
            weights.insert(group, share);
        }
        let remainder = 100 - share * scored.len() as u64;
        if remainder > 0 {
            warn!(
                "Scores don't divide evenly between groups, group {} gets {} extra points",
                last, remainder
            );
            weights.insert(last, share + remainder);
        }
        weights
    }

    /// Best total a solution can reach on the given groups
    pub fn possible_score(self, groups: &[GroupId], weights: &BTreeMap<GroupId, u64>) -> u64 {
        match self {
            ContestType::Icpc => 1,
            _ => groups
                .iter()
                .map(|g| weights.get(g).copied().unwrap_or(0))
                .sum(),
        }
    }

    /// Contest specific checks on the configured scores
    pub fn verify_config(
        self,
        scores: Option<&BTreeMap<GroupId, u64>>,
        total_score: Option<u64>,
    ) -> Result<(), JudgeError> {
        if self != ContestType::Oij {
            return Ok(());
        }
        let scores = scores
            .ok_or_else(|| JudgeError::config("Scores are not defined in config.yml."))?;
        let total: u64 = scores.values().sum();
        let expected = total_score.unwrap_or(100);
        if total != expected {
            return Err(JudgeError::config(format!(
                "Total score in config is {}, but should be {}.",
                total, expected
            )));
        }
        Ok(())
    }
}

/// Full score up to half the time limit, then linearly down to 1 point at the limit
fn time_decay(result: &ExecutionResult, time_limit_ms: u64, full: f64) -> f64 {
    if !result.status.is_ok() {
        return 0.0;
    }
    let limit = time_limit_ms as f64;
    let time = result.time_ms.max(0) as f64;
    if time <= limit / 2.0 {
        return full;
    }
    1.0 + ((result.points - 1.0) * ((limit - time) / (limit / 2.0))).trunc()
}

impl fmt::Display for ContestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ContestType {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(ContestType::Default),
            "oi" => Ok(ContestType::Oi),
            "oij" => Ok(ContestType::Oij),
            "icpc" => Ok(ContestType::Icpc),
            "talent" => Ok(ContestType::Talent),
            other => Err(JudgeError::config(format!("Unknown contest type \"{}\"", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(time_ms: i64, points: f64) -> ExecutionResult {
        ExecutionResult::new(Status::Accepted)
            .with_time(time_ms)
            .with_points(points)
    }

    fn groups(points: &[(GroupId, u64)]) -> BTreeMap<GroupId, GroupScore> {
        points
            .iter()
            .map(|&(g, p)| {
                (
                    g,
                    GroupScore {
                        status: Status::Accepted,
                        points: p,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_default_group_score() {
        let contest = ContestType::Default;
        assert_eq!(contest.group_score(&[100.0, 100.0, 100.0], 100), 100);
        assert_eq!(contest.group_score(&[50.0, 100.0, 100.0], 60), 30);
        assert_eq!(contest.group_score(&[0.0, 10.0, 20.0], 100), 0);
        assert_eq!(contest.group_score(&[10.0, 3.0, 5.0], 50), 1);
        assert_eq!(contest.group_score(&[], 50), 0);
    }

    #[test]
    fn test_default_test_score() {
        let contest = ContestType::Default;
        assert_eq!(contest.test_score(&ok(10, 73.0), 1000, 1024), 73.0);
        let wa = ExecutionResult::new(Status::WrongAnswer).with_points(50.0);
        assert_eq!(contest.test_score(&wa, 1000, 1024), 0.0);
    }

    #[test]
    fn test_default_global_score() {
        assert_eq!(
            ContestType::Default.global_score(&groups(&[(1, 25), (2, 0), (3, 50)]), 100),
            75
        );
    }

    #[test]
    fn test_icpc_scores() {
        let contest = ContestType::Icpc;
        assert_eq!(contest.test_score(&ok(10, 42.0), 1000, 1024), 1.0);
        assert_eq!(
            contest.test_score(&ExecutionResult::new(Status::TimeLimitExceeded), 1000, 1024),
            0.0
        );
        assert_eq!(contest.group_score(&[1.0, 0.0, 1.0], 1), 0);
        assert_eq!(contest.group_score(&[1.0, 1.0], 1), 1);
        assert_eq!(contest.global_score(&groups(&[(1, 1), (2, 0)]), 1), 0);
        assert_eq!(contest.global_score(&groups(&[(1, 1), (2, 1)]), 1), 1);
        assert_eq!(
            contest.assign_default_weights(&[0, 1, 2]),
            BTreeMap::from([(0, 1), (1, 1), (2, 1)])
        );
        assert_eq!(contest.possible_score(&[1, 2, 3], &BTreeMap::new()), 1);
    }

    #[test]
    fn test_oi_time_decay() {
        let contest = ContestType::Oi;
        assert_eq!(contest.test_score(&ok(1000, 100.0), 2000, 0), 100.0);
        assert_eq!(contest.test_score(&ok(1500, 100.0), 2000, 0), 50.0);
        assert_eq!(contest.test_score(&ok(1999, 100.0), 2000, 0), 1.0);
        assert_eq!(contest.test_score(&ok(1750, 42.0), 2000, 0), 11.0);
        assert_eq!(contest.test_score(&ok(1100, 78.0), 2000, 0), 70.0);
        assert_eq!(
            contest.test_score(&ExecutionResult::new(Status::WrongAnswer), 2000, 0),
            0.0
        );
    }

    #[test]
    fn test_talent_keeps_points_when_fast() {
        let contest = ContestType::Talent;
        assert_eq!(contest.test_score(&ok(500, 42.0), 2000, 0), 42.0);
        assert_eq!(contest.test_score(&ok(1500, 100.0), 2000, 0), 50.0);
    }

    #[test]
    fn test_assign_default_weights() {
        let weights = ContestType::Default.assign_default_weights(&[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(
            weights,
            BTreeMap::from([(0, 0), (1, 16), (2, 16), (3, 16), (4, 16), (5, 16), (6, 20)])
        );
        let even = ContestType::Default.assign_default_weights(&[1, 2, 3, 4]);
        assert_eq!(even.values().copied().collect::<Vec<_>>(), vec![25, 25, 25, 25]);
        assert_eq!(
            ContestType::Default.possible_score(&[1, 2], &even),
            50
        );
    }

    #[test]
    fn test_oij_requires_scores_summing_to_total() {
        let scores = BTreeMap::from([(1, 40), (2, 60)]);
        assert!(ContestType::Oij.verify_config(Some(&scores), None).is_ok());
        assert!(ContestType::Oij.verify_config(Some(&scores), Some(90)).is_err());
        assert!(ContestType::Oij.verify_config(None, None).is_err());
        assert!(ContestType::Default.verify_config(None, None).is_ok());
    }

    #[test]
    fn test_contest_type_from_str() {
        assert_eq!("ICPC".parse::<ContestType>().unwrap(), ContestType::Icpc);
        assert_eq!("oi".parse::<ContestType>().unwrap(), ContestType::Oi);
        assert!(matches!(
            "ioi".parse::<ContestType>(),
            Err(JudgeError::Config(_))
        ));
    }
}
