//! Planning entities: declarative chains, planning rules, and the plans
//! they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::Scene;
use crate::utils::{EngineError, EngineResult};

/// One node of a chain template; `id` is unique within the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub id: String,
    pub title: String,
    pub assigned_agent: String,
    #[serde(default)]
    pub skippable: bool,
}

/// Declarative DAG template the planner instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    pub name: String,
    pub nodes: Vec<ChainNode>,
    /// Directed `(from, to)` pairs over node ids.
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

impl Chain {
    /// Reject templates with unknown edge endpoints or cycles.
    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::validation(format!("chain '{}' has no nodes", self.id)));
        }
        let ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for (from, to) in &self.edges {
            if !ids.contains(&from.as_str()) || !ids.contains(&to.as_str()) {
                return Err(EngineError::validation(format!(
                    "chain '{}' edge ({}, {}) references unknown node",
                    self.id, from, to
                )));
            }
        }
        // Kahn's algorithm; leftovers mean a cycle.
        let mut in_degree: std::collections::HashMap<&str, usize> =
            ids.iter().map(|id| (*id, 0)).collect();
        for (_, to) in &self.edges {
            if let Some(d) = in_degree.get_mut(to.as_str()) {
                *d += 1;
            }
        }
        let mut queue: Vec<&str> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop() {
            visited += 1;
            for (from, to) in &self.edges {
                if from == node
                    && let Some(d) = in_degree.get_mut(to.as_str())
                {
                    *d -= 1;
                    if *d == 0 {
                        queue.push(to.as_str());
                    }
                }
            }
        }
        if visited != ids.len() {
            return Err(EngineError::validation(format!("chain '{}' contains a cycle", self.id)));
        }
        Ok(())
    }
}

/// Predicate that maps question features to a chain.
/// Score: 1 per keyword hit, 2 for a scene match, 2 for a loan_type match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningRule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub scene: Option<Scene>,
    #[serde(default)]
    pub loan_type: Option<String>,
    pub chain_id: String,
    pub priority: i64,
    pub enabled: bool,
}

impl PlanningRule {
    pub fn score(&self, question: &str, scene: &Scene, loan_type: Option<&str>) -> i64 {
        let question_lower = question.to_lowercase();
        let mut score = 0i64;
        for kw in &self.keywords {
            if !kw.is_empty() && question_lower.contains(&kw.to_lowercase()) {
                score += 1;
            }
        }
        if let Some(rule_scene) = &self.scene
            && rule_scene == scene
        {
            score += 2;
        }
        if let (Some(rule_lt), Some(req_lt)) = (&self.loan_type, loan_type)
            && rule_lt == req_lt
        {
            score += 2;
        }
        score
    }
}

/// Materialized task descriptor inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub title: String,
    pub assigned_agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub skippable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub question: String,
    pub scene: Scene,
    #[serde(default)]
    pub loan_type: Option<String>,
    pub tasks: Vec<TaskSpec>,
    pub edges: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}
