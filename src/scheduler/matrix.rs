//! Job matrix: one result cell per (solution, test)
//!
//! The coordinator is the only writer. The reporter works on cloned snapshots.

use std::collections::BTreeMap;

use crate::core::{ExecutionResult, GroupId, Status};
use crate::scoring::{ContestType, GroupScore, SolutionScore};

/// Column of the matrix: a test with its resolved limits
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixTest {
    pub name: String,
    pub group: GroupId,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

#[derive(Debug, Clone)]
pub struct JobMatrix {
    pub solutions: Vec<String>,
    pub tests: Vec<MatrixTest>,
    /// Row-major, `solutions.len() * tests.len()` cells
    cells: Vec<ExecutionResult>,
}

impl JobMatrix {
    /// Matrix with every cell pending
    pub fn new(solutions: Vec<String>, tests: Vec<MatrixTest>) -> Self {
        let cells = vec![ExecutionResult::pending(); solutions.len() * tests.len()];
        Self {
            solutions,
            tests,
            cells,
        }
    }

    fn index(&self, solution: usize, test: usize) -> usize {
        solution * self.tests.len() + test
    }

    pub fn get(&self, solution: usize, test: usize) -> &ExecutionResult {
        &self.cells[self.index(solution, test)]
    }

    /// Fill a pending cell. A cell that already holds a result is left
    /// untouched and `false` is returned.
    pub fn set(&mut self, solution: usize, test: usize, result: ExecutionResult) -> bool {
        let index = self.index(solution, test);
        if !self.cells[index].status.is_pending() {
            return false;
        }
        self.cells[index] = result;
        true
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.cells.iter().filter(|c| !c.status.is_pending()).count()
    }

    /// Groups present among the tests, ascending
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self.tests.iter().map(|t| t.group).collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    fn group_cells(&self, solution: usize, group: GroupId) -> impl Iterator<Item = (&MatrixTest, &ExecutionResult)> {
        self.tests
            .iter()
            .enumerate()
            .filter(move |(_, test)| test.group == group)
            .map(move |(t, test)| (test, self.get(solution, t)))
    }

    /// Worst status among the finished tests of a group
    pub fn group_status(&self, solution: usize, group: GroupId) -> Status {
        Status::worst_of(self.group_cells(solution, group).map(|(_, r)| r.status))
    }

    pub fn group_done(&self, solution: usize, group: GroupId) -> bool {
        self.group_cells(solution, group)
            .all(|(_, r)| !r.status.is_pending())
    }

    pub fn max_time(&self, solution: usize, group: GroupId) -> Option<i64> {
        self.group_cells(solution, group)
            .filter_map(|(_, r)| r.time())
            .max()
    }

    pub fn max_memory(&self, solution: usize, group: GroupId) -> Option<i64> {
        self.group_cells(solution, group)
            .filter_map(|(_, r)| r.memory())
            .max()
    }

    /// Largest time limit among the tests of a group
    pub fn group_time_limit(&self, group: GroupId) -> u64 {
        self.tests
            .iter()
            .filter(|t| t.group == group)
            .map(|t| t.time_limit_ms)
            .max()
            .unwrap_or(0)
    }

    pub fn group_memory_limit(&self, group: GroupId) -> u64 {
        self.tests
            .iter()
            .filter(|t| t.group == group)
            .map(|t| t.memory_limit_kb)
            .max()
            .unwrap_or(0)
    }

    /// Score of one solution over its fully finished groups
    pub fn score(&self, solution: usize, contest: ContestType, weights: &BTreeMap<GroupId, u64>) -> SolutionScore {
        let mut groups = BTreeMap::new();
        for group in self.groups() {
            if !self.group_done(solution, group) {
                continue;
            }
            let test_scores: Vec<f64> = self
                .group_cells(solution, group)
                .map(|(test, r)| contest.test_score(r, test.time_limit_ms, test.memory_limit_kb))
                .collect();
            let max = weights.get(&group).copied().unwrap_or(0);
            groups.insert(
                group,
                GroupScore {
                    status: self.group_status(solution, group),
                    points: contest.group_score(&test_scores, max),
                },
            );
        }
        let possible = contest.possible_score(&self.groups(), weights);
        let points = contest.global_score(&groups, possible);
        SolutionScore { groups, points }
    }

    /// Scores of all solutions, keyed by solution name
    pub fn scores(&self, contest: ContestType, weights: &BTreeMap<GroupId, u64>) -> BTreeMap<String, SolutionScore> {
        self.solutions
            .iter()
            .enumerate()
            .map(|(s, name)| (name.clone(), self.score(s, contest, weights)))
            .collect()
    }
}
