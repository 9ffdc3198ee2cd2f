//! Event memory: an append-only capped ring with keyword search, mirrored
//! to the metadata store for restarts.

use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::{MemoryEvent, MemoryEventType, Scene};
use crate::utils::{EngineError, EngineResult};

/// Optional hook: re-rank keyword hits with a semantic signal (embedding
/// similarity, recency decay). The store works without one.
pub trait SemanticEnhancer: Send + Sync {
    fn rerank(&self, query: &str, candidates: Vec<MemoryEvent>) -> Vec<MemoryEvent>;
}

pub struct MemoryStore {
    db: SqlitePool,
    ring: RwLock<VecDeque<MemoryEvent>>,
    cap: usize,
    enhancer: Option<std::sync::Arc<dyn SemanticEnhancer>>,
}

impl MemoryStore {
    pub fn new(db: SqlitePool, cap: usize) -> Self {
        Self { db, ring: RwLock::new(VecDeque::new()), cap, enhancer: None }
    }

    pub fn with_enhancer(mut self, enhancer: std::sync::Arc<dyn SemanticEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    /// Reload the most recent events from the store (startup).
    pub async fn hydrate(&self) -> EngineResult<usize> {
        let rows: Vec<(String, chrono::DateTime<chrono::Utc>, String, String, Option<String>, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                r#"SELECT id, ts, event_type, scene, user_text, result_summary, sql, metadata_json
                   FROM memory_events ORDER BY ts DESC LIMIT ?"#,
            )
            .bind(self.cap as i64)
            .fetch_all(&self.db)
            .await?;

        let mut ring = self
            .ring
            .write()
            .map_err(|_| EngineError::internal("memory ring poisoned"))?;
        ring.clear();
        for (id, ts, event_type, scene, user_text, result_summary, sql, metadata_json) in
            rows.into_iter().rev()
        {
            let event_type = match event_type.as_str() {
                "text_input" => MemoryEventType::TextInput,
                "voice_input" => MemoryEventType::VoiceInput,
                "file_upload" => MemoryEventType::FileUpload,
                "image_upload" => MemoryEventType::ImageUpload,
                "metric_action" => MemoryEventType::MetricAction,
                _ => MemoryEventType::AnalysisResult,
            };
            ring.push_back(MemoryEvent {
                id,
                ts,
                event_type,
                scene: Scene::parse(&scene),
                user_text,
                result_summary,
                sql,
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            });
        }
        Ok(ring.len())
    }

    /// Append one event; the ring evicts its oldest entry past the cap.
    pub async fn append(
        &self,
        event_type: MemoryEventType,
        scene: Scene,
        user_text: Option<String>,
        result_summary: Option<String>,
        sql: Option<String>,
    ) -> EngineResult<MemoryEvent> {
        let event = MemoryEvent {
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now(),
            event_type,
            scene,
            user_text,
            result_summary,
            sql,
            metadata: serde_json::Map::new(),
        };

        sqlx::query(
            r#"INSERT INTO memory_events (id, ts, event_type, scene, user_text, result_summary, sql, metadata_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&event.id)
        .bind(event.ts)
        .bind(event.event_type.as_str())
        .bind(event.scene.as_str())
        .bind(&event.user_text)
        .bind(&event.result_summary)
        .bind(&event.sql)
        .bind(serde_json::Value::Object(event.metadata.clone()).to_string())
        .execute(&self.db)
        .await?;

        let mut ring = self
            .ring
            .write()
            .map_err(|_| EngineError::internal("memory ring poisoned"))?;
        ring.push_back(event.clone());
        while ring.len() > self.cap {
            ring.pop_front();
        }

        Ok(event)
    }

    /// Keyword search over the ring: events sharing tokens with the query,
    /// best overlap first, most recent first within a score.
    pub fn search(&self, query: &str, scene: Option<&Scene>, limit: usize) -> Vec<MemoryEvent> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(str::to_string)
            .collect();

        let Ok(ring) = self.ring.read() else {
            return Vec::new();
        };

        let mut scored: Vec<(usize, &MemoryEvent)> = ring
            .iter()
            .filter(|event| scene.is_none_or(|s| event.scene == *s))
            .filter_map(|event| {
                let haystack = format!(
                    "{} {}",
                    event.user_text.as_deref().unwrap_or(""),
                    event.result_summary.as_deref().unwrap_or("")
                )
                .to_lowercase();
                let score = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0 || tokens.is_empty()).then_some((score, event))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.ts.cmp(&a.1.ts)));
        let hits: Vec<MemoryEvent> =
            scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect();

        match &self.enhancer {
            Some(enhancer) => enhancer.rerank(query, hits),
            None => hits,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(cap: usize) -> MemoryStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        crate::db::init_schema(&pool).await.expect("schema");
        MemoryStore::new(pool, cap)
    }

    #[tokio::test]
    async fn ring_is_capped() {
        let store = store(3).await;
        for i in 0..5 {
            store
                .append(
                    MemoryEventType::TextInput,
                    Scene::Dashboard,
                    Some(format!("question {}", i)),
                    None,
                    None,
                )
                .await
                .expect("append");
        }
        assert_eq!(store.len(), 3);

        // The oldest entries were evicted from the ring.
        let hits = store.search("question", None, 10);
        assert!(hits.iter().all(|e| {
            let text = e.user_text.as_deref().unwrap_or("");
            text.ends_with('2') || text.ends_with('3') || text.ends_with('4')
        }));
    }

    #[tokio::test]
    async fn search_ranks_by_overlap_and_scene() {
        let store = store(100).await;
        store
            .append(
                MemoryEventType::AnalysisResult,
                Scene::Dashboard,
                Some("monthly revenue by product".to_string()),
                None,
                Some("SELECT 1".to_string()),
            )
            .await
            .expect("append");
        store
            .append(
                MemoryEventType::AnalysisResult,
                Scene::LoanOps,
                Some("overdue rate by branch".to_string()),
                None,
                None,
            )
            .await
            .expect("append");

        let hits = store.search("revenue by product", Some(&Scene::Dashboard), 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sql.as_deref(), Some("SELECT 1"));

        let no_hits = store.search("revenue", Some(&Scene::LoanOps), 5);
        assert!(no_hits.is_empty());
    }

    #[tokio::test]
    async fn hydrate_restores_ring_from_store() {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        crate::db::init_schema(&pool).await.expect("schema");

        {
            let store = MemoryStore::new(pool.clone(), 10);
            store
                .append(
                    MemoryEventType::AnalysisResult,
                    Scene::Dashboard,
                    Some("persisted question".to_string()),
                    None,
                    None,
                )
                .await
                .expect("append");
        }

        let fresh = MemoryStore::new(pool, 10);
        assert!(fresh.is_empty());
        let restored = fresh.hydrate().await.expect("hydrate");
        assert_eq!(restored, 1);
        assert_eq!(fresh.search("persisted", None, 5).len(), 1);
    }
}
