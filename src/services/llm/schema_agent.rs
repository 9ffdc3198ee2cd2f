//! Schema agent: introspects a datasource and narrows the descriptor to
//! the tables plausibly relevant to the question.
//!
//! Ranking is heuristic (token overlap on table/column names, expanded by
//! foreign-key proximity); results are memoized per
//! `(datasource, question digest)` for a short TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Datasource, SchemaDescriptor, TableSchema};
use crate::services::memo::MemoCache;
use crate::services::pool::PoolManager;
use crate::utils::fingerprint;
use crate::utils::EngineResult;

/// Tables kept after relevance filtering.
const MAX_RELEVANT_TABLES: usize = 12;

pub struct SchemaAgent {
    pool_manager: Arc<PoolManager>,
    memo: Arc<MemoCache>,
    cache_ttl: Duration,
}

impl SchemaAgent {
    pub fn new(pool_manager: Arc<PoolManager>, memo: Arc<MemoCache>, cache_ttl: Duration) -> Self {
        Self { pool_manager, memo, cache_ttl }
    }

    /// Full descriptor, memoized.
    pub async fn full_schema(&self, datasource: &Datasource) -> EngineResult<SchemaDescriptor> {
        let key = fingerprint::schema_key(&datasource.id, None);
        let value = self
            .memo
            .get_or_compute(&key, self.cache_ttl, || async {
                let mut conn = self.pool_manager.acquire(datasource).await?;
                let descriptor = conn.adapter_mut().introspect().await?;
                Ok(serde_json::to_value(descriptor)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Descriptor filtered to the question's plausible tables.
    pub async fn relevant_schema(
        &self,
        datasource: &Datasource,
        question: Option<&str>,
    ) -> EngineResult<SchemaDescriptor> {
        let key = fingerprint::schema_key(&datasource.id, question);
        if let Some(hit) = self.memo.get(&key) {
            return Ok(serde_json::from_value(hit)?);
        }

        let full = self.full_schema(datasource).await?;
        let filtered = match question {
            Some(q) if !q.trim().is_empty() => filter_relevant(full, q),
            _ => full,
        };

        self.memo.put(&key, serde_json::to_value(&filtered)?, self.cache_ttl);
        Ok(filtered)
    }

    pub fn invalidate(&self, datasource_id: &str) {
        self.memo.invalidate_prefix(&format!("schema:{}:", datasource_id));
    }
}

/// Rank tables by question-token overlap, pull in FK neighbors of the
/// winners, cap the result. An empty intersection returns the full
/// descriptor rather than an empty one.
fn filter_relevant(descriptor: SchemaDescriptor, question: &str) -> SchemaDescriptor {
    let tokens = tokenize(question);
    if tokens.is_empty() || descriptor.tables.len() <= MAX_RELEVANT_TABLES {
        return descriptor;
    }

    let mut scored: Vec<(i64, &TableSchema)> = descriptor
        .tables
        .iter()
        .map(|table| (score_table(table, &tokens), table))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

    let mut keep: HashSet<String> = scored
        .iter()
        .filter(|(score, _)| *score > 0)
        .take(MAX_RELEVANT_TABLES)
        .map(|(_, t)| t.name.clone())
        .collect();

    if keep.is_empty() {
        return descriptor;
    }

    // FK proximity: neighbors of a kept table join cheaply, keep them too.
    let mut neighbors: HashSet<String> = HashSet::new();
    for table in &descriptor.tables {
        for column in &table.columns {
            if let Some(fk) = &column.foreign_key {
                if keep.contains(&table.name) {
                    neighbors.insert(fk.table.clone());
                }
                if keep.contains(&fk.table) {
                    neighbors.insert(table.name.clone());
                }
            }
        }
    }
    for neighbor in neighbors {
        if keep.len() >= MAX_RELEVANT_TABLES {
            break;
        }
        keep.insert(neighbor);
    }

    SchemaDescriptor {
        tables: descriptor
            .tables
            .into_iter()
            .filter(|t| keep.contains(&t.name))
            .collect(),
        dialect: descriptor.dialect,
    }
}

fn score_table(table: &TableSchema, tokens: &HashSet<String>) -> i64 {
    let mut score = 0i64;
    for token in tokens {
        if table.name.to_lowercase().contains(token) {
            score += 3;
        }
        for column in &table.columns {
            if column.name.to_lowercase().contains(token) {
                score += 1;
            }
        }
    }
    score
}

fn tokenize(question: &str) -> HashSet<String> {
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| {
            // Crude singularization so "products" matches "product_id".
            t.strip_suffix('s').unwrap_or(t).to_string()
        })
        .collect()
}
