//! Planning engine: rule-driven selection of a declarative chain, then
//! materialization into a Plan. Rules and chains are live-editable config.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Chain, ChainNode, Plan, PlanningRule, Scene, TaskSpec};
use crate::utils::{EngineError, EngineResult};

pub struct PlannerService {
    db: SqlitePool,
}

impl PlannerService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Install the built-in chain and catch-all rule when the tables are
    /// empty (first boot).
    pub async fn seed_defaults(&self) -> EngineResult<()> {
        let (rule_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM planning_rules")
            .fetch_one(&self.db)
            .await?;
        if rule_count > 0 {
            return Ok(());
        }

        let default_chain = Chain {
            id: "direct_analysis".to_string(),
            name: "Direct analysis".to_string(),
            nodes: vec![ChainNode {
                id: "analyze".to_string(),
                title: "Answer the question".to_string(),
                assigned_agent: "analysis".to_string(),
                skippable: false,
            }],
            edges: Vec::new(),
        };
        let review_chain = Chain {
            id: "loan_review".to_string(),
            name: "Loan portfolio review".to_string(),
            nodes: vec![
                ChainNode {
                    id: "schema".to_string(),
                    title: "Summarize relevant data".to_string(),
                    assigned_agent: "schema".to_string(),
                    skippable: true,
                },
                ChainNode {
                    id: "analyze".to_string(),
                    title: "Run the portfolio queries".to_string(),
                    assigned_agent: "analysis".to_string(),
                    skippable: false,
                },
                ChainNode {
                    id: "insight".to_string(),
                    title: "Draft findings".to_string(),
                    assigned_agent: "insight".to_string(),
                    skippable: false,
                },
                ChainNode {
                    id: "approval".to_string(),
                    title: "Strategy approval".to_string(),
                    assigned_agent: "approval".to_string(),
                    skippable: false,
                },
            ],
            edges: vec![
                ("schema".to_string(), "analyze".to_string()),
                ("analyze".to_string(), "insight".to_string()),
                ("insight".to_string(), "approval".to_string()),
            ],
        };
        self.put_chains(vec![default_chain, review_chain]).await?;

        self.put_rules(vec![
            PlanningRule {
                id: 0,
                name: "loan portfolio review".to_string(),
                keywords: vec!["overdue".to_string(), "loan".to_string(), "portfolio".to_string()],
                scene: Some(Scene::LoanOps),
                loan_type: None,
                chain_id: "loan_review".to_string(),
                priority: 10,
                enabled: true,
            },
            PlanningRule {
                id: 0,
                name: "default".to_string(),
                keywords: Vec::new(),
                scene: None,
                loan_type: None,
                chain_id: "direct_analysis".to_string(),
                priority: 100,
                enabled: true,
            },
        ])
        .await?;

        tracing::info!("Seeded default planning rules and chains");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Config: planning rules
    // ------------------------------------------------------------------

    pub async fn get_rules(&self) -> EngineResult<Vec<PlanningRule>> {
        let rows: Vec<(i64, String, String, Option<String>, Option<String>, String, i64, bool)> =
            sqlx::query_as(
                r#"SELECT id, name, keywords_json, scene, loan_type, chain_id, priority, enabled
                   FROM planning_rules ORDER BY id"#,
            )
            .fetch_all(&self.db)
            .await?;

        rows.into_iter()
            .map(|(id, name, keywords_json, scene, loan_type, chain_id, priority, enabled)| {
                Ok(PlanningRule {
                    id,
                    name,
                    keywords: serde_json::from_str(&keywords_json)?,
                    scene: scene.map(|s| Scene::parse(&s)),
                    loan_type,
                    chain_id,
                    priority,
                    enabled,
                })
            })
            .collect()
    }

    /// Replace the full rule set (config echo: `put(X); get() == normalize(X)`).
    pub async fn put_rules(&self, rules: Vec<PlanningRule>) -> EngineResult<Vec<PlanningRule>> {
        for rule in &rules {
            if rule.chain_id.is_empty() {
                return Err(EngineError::validation(format!(
                    "rule '{}' has no chain_id",
                    rule.name
                )));
            }
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM planning_rules").execute(&mut *tx).await?;
        for rule in &rules {
            sqlx::query(
                r#"INSERT INTO planning_rules
                   (name, keywords_json, scene, loan_type, chain_id, priority, enabled)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&rule.name)
            .bind(serde_json::to_string(&rule.keywords)?)
            .bind(rule.scene.as_ref().map(|s| s.as_str().to_string()))
            .bind(&rule.loan_type)
            .bind(&rule.chain_id)
            .bind(rule.priority)
            .bind(rule.enabled)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_rules().await
    }

    // ------------------------------------------------------------------
    // Config: chains
    // ------------------------------------------------------------------

    pub async fn get_chains(&self) -> EngineResult<Vec<Chain>> {
        let rows: Vec<(String, String, String, String)> =
            sqlx::query_as("SELECT id, name, nodes_json, edges_json FROM chains ORDER BY id")
                .fetch_all(&self.db)
                .await?;

        rows.into_iter()
            .map(|(id, name, nodes_json, edges_json)| {
                Ok(Chain {
                    id,
                    name,
                    nodes: serde_json::from_str(&nodes_json)?,
                    edges: serde_json::from_str(&edges_json)?,
                })
            })
            .collect()
    }

    pub async fn get_chain(&self, id: &str) -> EngineResult<Chain> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, name, nodes_json, edges_json FROM chains WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        let (id, name, nodes_json, edges_json) =
            row.ok_or_else(|| EngineError::not_found(format!("chain '{}' not found", id)))?;
        Ok(Chain {
            id,
            name,
            nodes: serde_json::from_str(&nodes_json)?,
            edges: serde_json::from_str(&edges_json)?,
        })
    }

    pub async fn put_chains(&self, chains: Vec<Chain>) -> EngineResult<Vec<Chain>> {
        for chain in &chains {
            chain.validate()?;
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM chains").execute(&mut *tx).await?;
        for chain in &chains {
            sqlx::query(
                r#"INSERT INTO chains (id, name, nodes_json, edges_json, updated_at)
                   VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)"#,
            )
            .bind(&chain.id)
            .bind(&chain.name)
            .bind(serde_json::to_string(&chain.nodes)?)
            .bind(serde_json::to_string(&chain.edges)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_chains().await
    }

    // ------------------------------------------------------------------
    // Plan building
    // ------------------------------------------------------------------

    /// Score every enabled rule against the question features; the best
    /// match picks the chain. Ties break by priority (lower value first)
    /// then insertion order.
    pub async fn build_plan(
        &self,
        question: &str,
        scene: &Scene,
        loan_type: Option<&str>,
    ) -> EngineResult<Plan> {
        if question.trim().is_empty() {
            return Err(EngineError::validation("question cannot be empty"));
        }

        let rules: Vec<PlanningRule> =
            self.get_rules().await?.into_iter().filter(|r| r.enabled).collect();
        if rules.is_empty() {
            return Err(EngineError::plan_infeasible("no enabled planning rules"));
        }

        let mut best: Option<(i64, &PlanningRule)> = None;
        for rule in &rules {
            let score = rule.score(question, scene, loan_type);
            let better = match best {
                None => true,
                Some((best_score, best_rule)) => {
                    score > best_score
                        || (score == best_score
                            && (rule.priority, rule.id) < (best_rule.priority, best_rule.id))
                },
            };
            if better {
                best = Some((score, rule));
            }
        }

        let (score, rule) = best.ok_or_else(|| {
            EngineError::plan_infeasible("no planning rule matched the question")
        })?;

        // A zero score only wins for catch-all rules (no predicate fields).
        if score == 0 && !(rule.keywords.is_empty() && rule.scene.is_none() && rule.loan_type.is_none())
        {
            return Err(EngineError::plan_infeasible(format!(
                "no planning rule matched question in scene '{}'",
                scene
            )));
        }

        let chain = self.get_chain(&rule.chain_id).await.map_err(|e| match e {
            EngineError::NotFound(msg) => EngineError::plan_infeasible(msg),
            other => other,
        })?;
        chain.validate()?;

        tracing::debug!(
            "Planner picked rule '{}' (score {}) -> chain '{}'",
            rule.name,
            score,
            chain.id
        );

        Ok(materialize(&chain, question, scene, loan_type))
    }
}

fn materialize(chain: &Chain, question: &str, scene: &Scene, loan_type: Option<&str>) -> Plan {
    let tasks = chain
        .nodes
        .iter()
        .map(|node| TaskSpec {
            task_id: node.id.clone(),
            title: node.title.clone(),
            assigned_agent: node.assigned_agent.clone(),
            depends_on: chain
                .edges
                .iter()
                .filter(|(_, to)| *to == node.id)
                .map(|(from, _)| from.clone())
                .collect(),
            skippable: node.skippable,
        })
        .collect();

    Plan {
        id: Uuid::new_v4().to_string(),
        question: question.to_string(),
        scene: scene.clone(),
        loan_type: loan_type.map(str::to_string),
        tasks,
        edges: chain.edges.clone(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn planner() -> PlannerService {
        let db = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        crate::db::init_schema(&db).await.expect("schema");
        let planner = PlannerService::new(db);
        planner.seed_defaults().await.expect("seed");
        planner
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let planner = planner().await;
        planner.seed_defaults().await.expect("second seed");
        assert_eq!(planner.get_rules().await.expect("rules").len(), 2);
        assert_eq!(planner.get_chains().await.expect("chains").len(), 2);
    }

    #[tokio::test]
    async fn keyword_and_scene_match_picks_the_review_chain() {
        let planner = planner().await;
        let plan = planner
            .build_plan("why is the overdue rate rising", &Scene::LoanOps, None)
            .await
            .expect("plan");

        assert_eq!(plan.tasks.len(), 4);
        let analyze = plan.tasks.iter().find(|t| t.task_id == "analyze").expect("analyze task");
        assert_eq!(analyze.depends_on, vec!["schema".to_string()]);
        let approval = plan.tasks.iter().find(|t| t.task_id == "approval").expect("approval");
        assert_eq!(approval.assigned_agent, "approval");
    }

    #[tokio::test]
    async fn unmatched_questions_fall_back_to_the_catch_all() {
        let planner = planner().await;
        let plan = planner
            .build_plan("show revenue by product", &Scene::Dashboard, None)
            .await
            .expect("plan");
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].assigned_agent, "analysis");
    }

    #[tokio::test]
    async fn no_rules_is_infeasible() {
        let planner = planner().await;
        planner.put_rules(Vec::new()).await.expect("clear rules");
        let err = planner
            .build_plan("anything", &Scene::Dashboard, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PLAN_INFEASIBLE");
    }

    #[tokio::test]
    async fn config_round_trips() {
        let planner = planner().await;
        let rules = planner.get_rules().await.expect("rules");
        let echoed = planner.put_rules(rules.clone()).await.expect("put");
        assert_eq!(echoed.len(), rules.len());
        assert_eq!(echoed[0].name, rules[0].name);
        assert_eq!(echoed[0].keywords, rules[0].keywords);

        let chains = planner.get_chains().await.expect("chains");
        let echoed = planner.put_chains(chains.clone()).await.expect("put");
        assert_eq!(echoed, chains);
    }

    #[tokio::test]
    async fn cyclic_chain_is_rejected() {
        let planner = planner().await;
        let bad = Chain {
            id: "bad".to_string(),
            name: "Bad".to_string(),
            nodes: vec![
                ChainNode {
                    id: "a".to_string(),
                    title: "A".to_string(),
                    assigned_agent: "analysis".to_string(),
                    skippable: false,
                },
                ChainNode {
                    id: "b".to_string(),
                    title: "B".to_string(),
                    assigned_agent: "analysis".to_string(),
                    skippable: false,
                },
            ],
            edges: vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "a".to_string()),
            ],
        };
        let err = planner.put_chains(vec![bad]).await.unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }
}
